//! Job status table.
//!
//! The table lock is only held long enough to find or insert a record
//! handle. Each record carries its own lock, so writers of different jobs
//! never contend and readers never wait on the table.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{PipelineError, PipelineResult};
use crate::job::{JobId, JobRecord, JobState};

type RecordHandle = Arc<RwLock<JobRecord>>;

/// Concurrency-safe table of job records with retention pruning.
#[derive(Debug, Default)]
pub struct StatusStore {
    records: RwLock<FxHashMap<JobId, RecordHandle>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, id: &JobId) -> PipelineResult<RecordHandle> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))
    }

    /// Insert a record, or replace the stored record with the same id.
    pub fn put(&self, record: JobRecord) {
        if let Ok(existing) = self.handle(&record.id) {
            *existing.write() = record;
            return;
        }
        let id = record.id.clone();
        let mut table = self.records.write();
        match table.get(&id) {
            Some(existing) => *existing.write() = record,
            None => {
                table.insert(id, Arc::new(RwLock::new(record)));
            }
        }
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &JobId) -> PipelineResult<JobRecord> {
        Ok(self.handle(id)?.read().clone())
    }

    /// Mutate one record under its own write lock.
    ///
    /// `f` works on a copy; the copy is committed only if `f` returns `Ok`,
    /// so a rejected transition leaves the stored record untouched.
    pub fn update<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut JobRecord) -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        let handle = self.handle(id)?;
        let mut guard = handle.write();
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        *guard = draft;
        Ok(out)
    }

    fn snapshot(&self) -> Vec<JobRecord> {
        let handles: Vec<RecordHandle> = self.records.read().values().cloned().collect();
        handles.iter().map(|h| h.read().clone()).collect()
    }

    /// All `PENDING` and `RUNNING` jobs, oldest first.
    pub fn list_active(&self) -> Vec<JobRecord> {
        let mut active: Vec<JobRecord> = self
            .snapshot()
            .into_iter()
            .filter(|r| r.state.is_active())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    /// Jobs matching an optional state filter, newest first.
    pub fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .snapshot()
            .into_iter()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Remove terminal jobs that finished before `older_than`.
    ///
    /// `PENDING` and `RUNNING` jobs are never pruned. Returns the number of
    /// records removed.
    pub fn prune(&self, older_than: DateTime<Utc>) -> usize {
        let mut table = self.records.write();
        let before = table.len();
        table.retain(|_, handle| {
            let rec = handle.read();
            !(rec.state.is_terminal() && rec.finished_at.is_some_and(|t| t < older_than))
        });
        let removed = before - table.len();
        if removed > 0 {
            tracing::debug!(removed, %older_than, "Pruned job records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every record to `path` as JSON.
    pub fn save_snapshot(&self, path: &Path) -> PipelineResult<()> {
        let mut records = self.snapshot();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a snapshot written by [`save_snapshot`](Self::save_snapshot).
    ///
    /// Jobs that were still in flight when the snapshot was taken belong to
    /// a process that no longer exists; they are marked `FAILED`.
    pub fn load_snapshot(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let records: Vec<JobRecord> = serde_json::from_str(&content)?;
        let store = Self::new();
        for mut record in records {
            if record.state.is_active() {
                let err = PipelineError::StageExecution {
                    stage: record.current_stage().unwrap_or("none").to_string(),
                    diagnostic: "interrupted by orchestrator restart".into(),
                };
                record.fail(JobState::Failed, &err)?;
                tracing::warn!(job_id = %record.id, "Marked interrupted job as failed");
            }
            store.put(record);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRequest, JobType};

    fn record(id: &str) -> JobRecord {
        JobRecord::new(JobId::new(id), &JobRequest::new(JobType::Collect), 60)
    }

    fn finished(id: &str, state: JobState) -> JobRecord {
        let mut rec = record(id);
        rec.transition(JobState::Running).unwrap();
        rec.transition(state).unwrap();
        rec
    }

    #[test]
    fn test_put_and_get() {
        let store = StatusStore::new();
        store.put(record("a"));
        assert_eq!(store.get(&"a".into()).unwrap().state, JobState::Pending);
        assert!(matches!(
            store.get(&"missing".into()),
            Err(PipelineError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_update_commits_only_on_success() {
        let store = StatusStore::new();
        store.put(finished("a", JobState::Succeeded));

        let res = store.update(&"a".into(), |r| r.transition(JobState::Running));
        assert!(res.is_err());
        assert_eq!(store.get(&"a".into()).unwrap().state, JobState::Succeeded);

        store.put(record("b"));
        store
            .update(&"b".into(), |r| r.transition(JobState::Running))
            .unwrap();
        assert_eq!(store.get(&"b".into()).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_list_active() {
        let store = StatusStore::new();
        store.put(record("pending"));
        store.put(finished("done", JobState::Failed));
        let active = store.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "pending");
    }

    #[test]
    fn test_list_filter_and_limit() {
        let store = StatusStore::new();
        store.put(finished("a", JobState::Succeeded));
        store.put(finished("b", JobState::Failed));
        store.put(finished("c", JobState::Succeeded));
        assert_eq!(store.list(Some(JobState::Succeeded), 10).len(), 2);
        assert_eq!(store.list(None, 2).len(), 2);
    }

    #[test]
    fn test_prune_keeps_active_jobs() {
        let store = StatusStore::new();
        store.put(record("pending"));
        let mut running = record("running");
        running.transition(JobState::Running).unwrap();
        store.put(running);
        store.put(finished("done", JobState::Cancelled));

        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.prune(future), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(&"done".into()).is_err());

        // Nothing finished before this cutoff.
        assert_eq!(store.prune(Utc::now() - chrono::Duration::hours(1)), 0);
    }

    #[test]
    fn test_concurrent_updates_to_independent_jobs() {
        let store = Arc::new(StatusStore::new());
        for i in 0..8 {
            store.put(record(&format!("job-{i}")));
        }
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update(&JobId::new(format!("job-{i}")), |r| {
                            r.transition(JobState::Running)
                        })
                        .unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(
            store
                .list_active()
                .iter()
                .all(|r| r.state == JobState::Running)
        );
    }

    #[test]
    fn test_snapshot_round_trip_marks_interrupted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = StatusStore::new();
        store.put(finished("done", JobState::Succeeded));
        let mut running = record("running");
        running.transition(JobState::Running).unwrap();
        store.put(running);
        store.save_snapshot(&path).unwrap();

        let loaded = StatusStore::load_snapshot(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(&"done".into()).unwrap().state,
            JobState::Succeeded
        );
        let interrupted = loaded.get(&"running".into()).unwrap();
        assert_eq!(interrupted.state, JobState::Failed);
        assert!(interrupted.error.unwrap().message.contains("interrupted"));
    }
}
