//! Job admission, dispatch and lifecycle enforcement.
//!
//! ```text
//!   submit() ──admission──→ StatusStore (PENDING) ──→ priority queue
//!                                                        │
//!                     ┌──────────── worker × N ◀─────────┘
//!                     │   PENDING → RUNNING, watchdog armed
//!                     │   for each stage: StageRunner::run, persist progress
//!                     │   terminal state written to StatusStore
//!                     └──────────→ result channel ──→ coordinator (statistics)
//! ```
//!
//! **Guarantees:**
//! - At most `max_concurrent_jobs` jobs are `RUNNING` (one per worker).
//! - At most one job per [`JobType`] is in flight (single-flight).
//! - Queued jobs are dispatched highest priority first, FIFO within a priority.
//! - Stages of one job run strictly in sequence.
//! - Cancellation is checked at stage boundaries; a stage still running
//!   after the grace period is killed.
//! - The watchdog forces `TIMED_OUT` once a running job exceeds its timeout.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::job::{
    ArtifactRef, JobId, JobRecord, JobRequest, JobState, JobType, MAX_PRIORITY, MIN_PRIORITY,
    STAGE_FORECAST,
};
use crate::stage::{StageContext, StageRunner};
use crate::store::StatusStore;

/// Bounds for a per-request timeout override, in seconds.
pub const MIN_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 7_200;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to do with a submission when every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Reject with `Admission` once `max_concurrent_jobs` are in flight.
    Reject,
    /// Hold up to `capacity` extra jobs in `PENDING`.
    Queue { capacity: usize },
}

impl AdmissionPolicy {
    pub fn queue_capacity(&self) -> usize {
        match self {
            AdmissionPolicy::Reject => 0,
            AdmissionPolicy::Queue { capacity } => *capacity,
        }
    }
}

/// Watchdog duration per job type, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTimeouts {
    pub collect: u64,
    pub preprocess: u64,
    pub forecast: u64,
    pub pipeline: u64,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            collect: 1_800,
            preprocess: 3_600,
            forecast: 1_800,
            pipeline: 7_200,
        }
    }
}

impl JobTimeouts {
    pub fn for_type(&self, job_type: JobType) -> u64 {
        match job_type {
            JobType::Collect => self.collect,
            JobType::Preprocess => self.preprocess,
            JobType::Forecast => self.forecast,
            JobType::Pipeline => self.pipeline,
        }
    }
}

/// Runtime settings of a [`JobManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent_jobs: usize,
    pub admission: AdmissionPolicy,
    /// Upper bound on any job's watchdog duration.
    pub job_timeout: Duration,
    pub type_timeouts: JobTimeouts,
    /// Time a cancelled stage gets to finish before it is killed.
    pub cancel_grace: Duration,
    /// Terminal jobs older than this are pruned.
    pub retention: Duration,
    pub prune_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            admission: AdmissionPolicy::Reject,
            job_timeout: Duration::from_secs(7_200),
            type_timeouts: JobTimeouts::default(),
            cancel_grace: Duration::from_secs(10),
            retention: Duration::from_secs(86_400),
            prune_interval: Duration::from_secs(300),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(PipelineError::Configuration(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.job_timeout.as_secs() == 0 {
            return Err(PipelineError::Configuration(
                "job timeout must be at least 1 second".into(),
            ));
        }
        if let Some(job_type) = JobType::ALL
            .iter()
            .find(|t| self.type_timeouts.for_type(**t) == 0)
        {
            return Err(PipelineError::Configuration(format!(
                "{job_type} timeout must be at least 1 second"
            )));
        }
        if self.prune_interval.is_zero() {
            return Err(PipelineError::Configuration(
                "prune interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Most jobs that may be in flight at once.
    pub fn admission_limit(&self) -> usize {
        self.max_concurrent_jobs + self.admission.queue_capacity()
    }

    /// Default watchdog for `job_type`, capped by `job_timeout`.
    pub fn timeout_for(&self, job_type: JobType) -> u64 {
        self.type_timeouts
            .for_type(job_type)
            .min(self.job_timeout.as_secs())
    }
}

/// Counters maintained from the result channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStatistics {
    pub submitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub pending: usize,
    pub running: usize,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
}

/// Terminal outcome sent from a worker to the coordinator.
#[derive(Debug)]
struct JobReport {
    id: JobId,
    job_type: JobType,
    state: JobState,
    elapsed: Duration,
}

/// Pending job ids ordered by descending priority, then admission order.
#[derive(Debug, Default)]
struct JobQueue {
    entries: BTreeMap<(Reverse<u8>, u64), JobId>,
    next_seq: u64,
}

impl JobQueue {
    fn push(&mut self, id: JobId, priority: u8) {
        self.entries.insert((Reverse(priority), self.next_seq), id);
        self.next_seq += 1;
    }

    fn pop(&mut self) -> Option<JobId> {
        self.entries.pop_first().map(|(_, id)| id)
    }

    fn remove(&mut self, id: &JobId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, queued| queued != id);
        self.entries.len() != before
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain(&mut self) -> Vec<JobId> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

struct Inner {
    config: ManagerConfig,
    store: Arc<StatusStore>,
    runner: StageRunner,
    queue: Mutex<JobQueue>,
    wakeup: Notify,
    reports: mpsc::UnboundedSender<JobReport>,
    tokens: Mutex<FxHashMap<JobId, CancellationToken>>,
    admission: Mutex<()>,
    stats: Mutex<ManagerStatistics>,
    /// Stops admission, workers and the pruner.
    shutdown: CancellationToken,
    /// Stops the coordinator once every worker has exited.
    halt: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts jobs and drives them through their stage chains.
///
/// Cheap to clone; clones share the same workers and store.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .field("runner", &self.inner.runner)
            .finish()
    }
}

impl JobManager {
    /// Spawn the worker pool, coordinator and pruner.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: ManagerConfig,
        store: Arc<StatusStore>,
        runner: StageRunner,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let (reports, reports_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            store,
            runner,
            queue: Mutex::new(JobQueue::default()),
            wakeup: Notify::new(),
            reports,
            tokens: Mutex::new(FxHashMap::default()),
            admission: Mutex::new(()),
            stats: Mutex::new(ManagerStatistics::default()),
            shutdown: CancellationToken::new(),
            halt: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            coordinator: Mutex::new(None),
        });

        let workers = (0..inner.config.max_concurrent_jobs)
            .map(|worker| tokio::spawn(worker_loop(worker, Arc::clone(&inner))))
            .collect();
        *inner.workers.lock() = workers;
        *inner.coordinator.lock() = Some(tokio::spawn(coordinator_loop(Arc::clone(&inner), reports_rx)));
        tokio::spawn(prune_loop(Arc::clone(&inner)));

        tracing::info!(
            workers = inner.config.max_concurrent_jobs,
            admission = ?inner.config.admission,
            stages = ?inner.runner.stage_names(),
            "Job manager started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.inner.store
    }

    /// Admit a job. Returns immediately; execution proceeds on a worker.
    pub fn submit(&self, request: JobRequest) -> PipelineResult<JobId> {
        let result = self.admit(request);
        if let Err(err) = &result {
            self.inner.stats.lock().rejected += 1;
            tracing::warn!(error = %err, "Job submission rejected");
        }
        result
    }

    fn admit(&self, request: JobRequest) -> PipelineResult<JobId> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(PipelineError::Admission("job manager is shutting down".into()));
        }
        let timeout_secs = self.validate(&request)?;

        let _guard = inner.admission.lock();
        if inner.shutdown.is_cancelled() {
            return Err(PipelineError::Admission("job manager is shutting down".into()));
        }
        let active = inner.store.list_active();
        if active.iter().any(|r| r.job_type == request.job_type) {
            return Err(PipelineError::ResourceBusy(request.job_type.to_string()));
        }
        if active.len() >= inner.config.admission_limit() {
            return Err(PipelineError::Admission(format!(
                "{} jobs already in flight (limit {})",
                active.len(),
                inner.config.admission_limit()
            )));
        }

        let id = JobId::generate();
        let record = JobRecord::new(id.clone(), &request, timeout_secs);
        let stages = record.stages.clone();
        inner.store.put(record);
        inner.tokens.lock().insert(id.clone(), CancellationToken::new());
        inner.queue.lock().push(id.clone(), request.priority);
        inner.wakeup.notify_one();
        inner.stats.lock().submitted += 1;

        tracing::info!(
            job_id = %id,
            job_type = %request.job_type,
            priority = request.priority,
            stages = ?stages,
            timeout_secs,
            "Job admitted"
        );
        Ok(id)
    }

    /// Check a request before admission; returns the effective timeout.
    fn validate(&self, request: &JobRequest) -> PipelineResult<u64> {
        let stages = request.resolved_stages();
        if stages.is_empty() {
            return Err(PipelineError::Validation("stage chain is empty".into()));
        }
        if let Some(unknown) = stages.iter().find(|s| !self.inner.runner.contains(s)) {
            return Err(PipelineError::Validation(format!("unknown stage '{unknown}'")));
        }
        if let Some(pos) = stages.iter().position(|s| s == STAGE_FORECAST) {
            if pos != stages.len() - 1 {
                return Err(PipelineError::Validation(
                    "the forecast stage must be the last stage of a chain".into(),
                ));
            }
        }
        if !(request.params.is_null() || request.params.is_object()) {
            return Err(PipelineError::Validation("params must be a JSON object".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
            return Err(PipelineError::Validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
            )));
        }

        let default_secs = self.inner.config.timeout_for(request.job_type);
        match request.timeout_secs {
            None => Ok(default_secs),
            Some(secs) => {
                let max = MAX_REQUEST_TIMEOUT_SECS.min(default_secs);
                if (MIN_REQUEST_TIMEOUT_SECS..=max).contains(&secs) {
                    Ok(secs)
                } else {
                    Err(PipelineError::Validation(format!(
                        "timeout must be between {MIN_REQUEST_TIMEOUT_SECS} and {max} seconds"
                    )))
                }
            }
        }
    }

    pub fn status(&self, id: &JobId) -> PipelineResult<JobRecord> {
        self.inner.store.get(id)
    }

    /// Jobs matching an optional state filter, newest first.
    pub fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobRecord> {
        self.inner.store.list(state, limit)
    }

    /// Cancel a `PENDING` or `RUNNING` job.
    ///
    /// A pending job is cancelled immediately and leaves the queue. A
    /// running job is signalled; it stops at the next stage boundary, or
    /// has its current stage killed once the grace period elapses.
    pub fn cancel(&self, id: &JobId) -> PipelineResult<()> {
        let inner = &self.inner;
        if !inner.cancel_pending(id, "cancelled before dispatch")? {
            if let Some(token) = inner.tokens.lock().get(id) {
                token.cancel();
                tracing::info!(job_id = %id, "Cancellation requested for running job");
            }
        }
        Ok(())
    }

    /// Live counters plus current pending/running counts.
    pub fn statistics(&self) -> ManagerStatistics {
        let mut stats = self.inner.stats.lock().clone();
        for record in self.inner.store.list_active() {
            match record.state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.running += 1,
                _ => {}
            }
        }
        stats.max_concurrent_jobs = self.inner.config.max_concurrent_jobs;
        stats.queue_capacity = self.inner.config.admission.queue_capacity();
        stats
    }

    /// Wait for a job to reach a terminal state.
    ///
    /// Polls every 100ms. Time spent queued does not count; once the job is
    /// running, gives up with `Timeout` after the job's own timeout plus the
    /// cancellation grace period.
    pub async fn wait(&self, id: &JobId) -> PipelineResult<JobRecord> {
        let mut deadline = None;
        loop {
            let record = self.status(id)?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            if record.state == JobState::Running {
                let deadline = *deadline.get_or_insert_with(|| {
                    Instant::now()
                        + Duration::from_secs(record.timeout_secs)
                        + self.inner.config.cancel_grace
                        + Duration::from_secs(5)
                });
                if Instant::now() >= deadline {
                    return Err(PipelineError::Timeout(format!("waiting for job {id}")));
                }
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Stop accepting work, cancel every in-flight job and wait for the
    /// workers to finish.
    ///
    /// Queued jobs end `CANCELLED` without running. Returns once every
    /// terminal outcome has been counted.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let _guard = inner.admission.lock();
            inner.shutdown.cancel();
            let queued = inner.queue.lock().drain();
            for id in &queued {
                if let Err(err) = inner.cancel_pending(id, "job manager shut down before dispatch") {
                    tracing::debug!(job_id = %id, error = %err, "Queued job already left PENDING");
                }
            }
            for token in inner.tokens.lock().values() {
                token.cancel();
            }
            tracing::info!(queued = queued.len(), "Job manager shutting down");
        }

        let workers = std::mem::take(&mut *inner.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Worker task failed");
            }
        }

        inner.halt.cancel();
        let coordinator = inner.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            if let Err(err) = coordinator.await {
                tracing::error!(error = %err, "Coordinator task failed");
            }
        }
        tracing::info!("Job manager stopped");
    }
}

async fn worker_loop(worker: usize, inner: Arc<Inner>) {
    loop {
        let next = {
            let mut queue = inner.queue.lock();
            let next = queue.pop();
            if next.is_some() && !queue.is_empty() {
                inner.wakeup.notify_one();
            }
            next
        };
        match next {
            Some(id) => {
                if let Some(report) = inner.execute(&id).await {
                    let _ = inner.reports.send(report);
                }
            }
            None => {
                tokio::select! {
                    () = inner.shutdown.cancelled() => break,
                    () = inner.wakeup.notified() => {}
                }
            }
        }
    }
    tracing::debug!(worker, "Worker stopped");
}

async fn coordinator_loop(inner: Arc<Inner>, mut reports: mpsc::UnboundedReceiver<JobReport>) {
    loop {
        tokio::select! {
            biased;
            report = reports.recv() => match report {
                Some(report) => record_report(&inner, &report),
                None => break,
            },
            () = inner.halt.cancelled() => {
                while let Ok(report) = reports.try_recv() {
                    record_report(&inner, &report);
                }
                break;
            }
        }
    }
    tracing::debug!("Coordinator stopped");
}

fn record_report(inner: &Inner, report: &JobReport) {
    let mut stats = inner.stats.lock();
    match report.state {
        JobState::Succeeded => stats.succeeded += 1,
        JobState::Failed => stats.failed += 1,
        JobState::TimedOut => stats.timed_out += 1,
        JobState::Cancelled => stats.cancelled += 1,
        JobState::Pending | JobState::Running => {}
    }
    drop(stats);

    tracing::info!(
        job_id = %report.id,
        job_type = %report.job_type,
        state = %report.state,
        elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        "Job finished"
    );
}

async fn prune_loop(inner: Arc<Inner>) {
    let retention = chrono::Duration::from_std(inner.config.retention).unwrap_or(chrono::Duration::MAX);
    let mut interval = tokio::time::interval(inner.config.prune_interval);
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Some(cutoff) = Utc::now().checked_sub_signed(retention) {
                    let removed = inner.store.prune(cutoff);
                    if removed > 0 {
                        tracing::info!(removed, "Pruned expired job records");
                    }
                }
            }
        }
    }
}

/// Resolves once `token` is cancelled and `grace` has then elapsed.
async fn grace_expired(token: &CancellationToken, grace: Duration) {
    token.cancelled().await;
    tokio::time::sleep(grace).await;
}

impl Inner {
    /// Move a `PENDING` job straight to `CANCELLED`.
    ///
    /// Returns `false` if the job is already running; terminal jobs are an
    /// `InvalidState` error.
    fn cancel_pending(&self, id: &JobId, reason: &str) -> PipelineResult<bool> {
        let cancelled = self.store.update(id, |r| match r.state {
            JobState::Pending => {
                r.fail(JobState::Cancelled, &PipelineError::Cancelled(reason.into()))?;
                Ok(Some(r.job_type))
            }
            JobState::Running => Ok(None),
            state => Err(PipelineError::InvalidState {
                job: id.to_string(),
                state: state.to_string(),
            }),
        })?;

        let Some(job_type) = cancelled else {
            return Ok(false);
        };
        self.queue.lock().remove(id);
        self.tokens.lock().remove(id);
        let _ = self.reports.send(JobReport {
            id: id.clone(),
            job_type,
            state: JobState::Cancelled,
            elapsed: Duration::ZERO,
        });
        tracing::info!(job_id = %id, job_type = %job_type, "Queued job cancelled");
        Ok(true)
    }

    /// Run one dequeued job to a terminal state.
    ///
    /// Returns `None` if the job left `PENDING` before a worker got to it.
    async fn execute(&self, id: &JobId) -> Option<JobReport> {
        let token = self.tokens.lock().get(id).cloned().unwrap_or_default();

        let record = match self.store.update(id, |r| {
            r.transition(JobState::Running)?;
            Ok(r.clone())
        }) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(job_id = %id, error = %err, "Skipping job that is no longer pending");
                self.tokens.lock().remove(id);
                return None;
            }
        };

        tracing::info!(job_id = %id, job_type = %record.job_type, "Job started");
        let started = Instant::now();
        let watchdog = Duration::from_secs(record.timeout_secs);

        let outcome = match tokio::time::timeout(watchdog, self.run_stages(&record, &token)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::Timeout(format!(
                "job {id} exceeded {}s",
                record.timeout_secs
            ))),
        };

        let state = match &outcome {
            Ok(()) => JobState::Succeeded,
            Err(PipelineError::Timeout(_)) => JobState::TimedOut,
            Err(PipelineError::Cancelled(_)) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };
        if let Err(err) = &outcome {
            tracing::warn!(job_id = %id, state = %state, error = %err, "Job did not succeed");
        }

        let written = self.store.update(id, |r| match &outcome {
            Ok(()) => r.transition(JobState::Succeeded),
            Err(err) => r.fail(state, err),
        });
        if let Err(err) = written {
            tracing::error!(job_id = %id, error = %err, "Failed to record terminal state");
        }
        self.tokens.lock().remove(id);

        Some(JobReport {
            id: id.clone(),
            job_type: record.job_type,
            state,
            elapsed: started.elapsed(),
        })
    }

    /// Execute the stage chain, persisting progress after every stage.
    async fn run_stages(&self, record: &JobRecord, token: &CancellationToken) -> PipelineResult<()> {
        let mut input = ArtifactRef::initial(&record.id, &record.params);

        for (index, stage) in record.stages.iter().enumerate() {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled(format!(
                    "stopped before stage '{stage}'"
                )));
            }

            let ctx = StageContext {
                job_id: record.id.clone(),
                job_type: record.job_type,
                params: record.params.clone(),
                cancel: token.clone(),
            };
            let run = self.runner.run(stage, input.clone(), ctx);
            tokio::pin!(run);

            let result = tokio::select! {
                result = &mut run => result,
                () = grace_expired(token, self.config.cancel_grace) => {
                    return Err(PipelineError::Cancelled(format!(
                        "stage '{stage}' killed after {}s grace period",
                        self.config.cancel_grace.as_secs()
                    )));
                }
            };

            let output = result.clone().into_output();
            self.store.update(&record.id, |r| {
                r.record_stage(index, result);
                Ok(())
            })?;
            input = output?;
        }
        Ok(())
    }
}
