//! Transport-agnostic request/response surface.
//!
//! | Operation | Success | Errors |
//! |-----------|---------|--------|
//! | [`create_job`](ForecastService::create_job) | [`JobCreated`] | `Validation`, `Admission`, `ResourceBusy` |
//! | [`get_job`](ForecastService::get_job) | [`JobView`] | `JobNotFound` |
//! | [`cancel_job`](ForecastService::cancel_job) | [`CancelAck`] | `JobNotFound`, `InvalidState` |
//! | [`get_latest_forecast`](ForecastService::get_latest_forecast) | [`ForecastResult`] | `ForecastUnavailable` |
//! | [`list_forecasts`](ForecastService::list_forecasts) | `Vec<ForecastResult>` | none |
//! | [`list_jobs`](ForecastService::list_jobs) | `Vec<JobView>` | none |
//! | [`statistics`](ForecastService::statistics) | [`ManagerStatistics`] | none |
//!
//! Every response type is `Serialize`, so any transport can put them on the wire.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::ensemble::{ForecastEnsembleEngine, ForecastResult};
use crate::error::{PipelineError, PipelineResult};
use crate::forecast::{CommandModel, ForecastStage, ForecastStore};
use crate::job::{
    ArtifactRef, ErrorDetail, JobId, JobRecord, JobRequest, JobState, JobType, STAGE_FORECAST,
    StageResult,
};
use crate::manager::{JobManager, ManagerStatistics};
use crate::stage::{CommandStage, StageRunner};
use crate::store::StatusStore;

/// Response to a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

/// Externally visible view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub stages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_stage: Option<usize>,
    /// Fraction of the stage chain completed, `0.0..=1.0`.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub history: Vec<StageResult>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let progress = if record.stages.is_empty() {
            0.0
        } else {
            record.completed_stages() as f64 / record.stages.len() as f64
        };
        Self {
            job_id: record.id,
            job_type: record.job_type,
            state: record.state,
            stages: record.stages,
            last_completed_stage: record.last_completed_stage,
            progress,
            error: record.error,
            result_ref: record.output,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            history: record.history,
        }
    }
}

/// Acknowledgement of a cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAck {
    pub job_id: JobId,
    /// State right after the request; a running job stays `RUNNING` until
    /// its current stage yields.
    pub state: JobState,
}

/// Facade over the job manager and the published forecasts.
#[derive(Debug, Clone)]
pub struct ForecastService {
    manager: JobManager,
    forecasts: Arc<ForecastStore>,
    state_file: Option<PathBuf>,
}

impl ForecastService {
    pub fn new(manager: JobManager, forecasts: Arc<ForecastStore>) -> Self {
        Self {
            manager,
            forecasts,
            state_file: None,
        }
    }

    /// Build the full service from configuration.
    ///
    /// Configured commands become stages; configured models feed a
    /// [`ForecastStage`] registered as `forecast`. Must be called from
    /// within a Tokio runtime.
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;

        let forecasts = Arc::new(ForecastStore::new(config.forecast_history));
        let mut runner = StageRunner::new();
        for (name, spec) in &config.stages {
            runner.register(Arc::new(CommandStage::new(name.clone(), spec.clone())));
        }
        if !config.models.is_empty() {
            if config.stages.contains_key(STAGE_FORECAST) {
                return Err(PipelineError::Configuration(
                    "configure either a 'forecast' stage command or forecast models, not both".into(),
                ));
            }
            let mut stage = ForecastStage::new(
                ForecastEnsembleEngine::new(config.ensemble.clone()),
                Arc::clone(&forecasts),
            )
            .with_horizons(config.horizons.clone());
            for (id, spec) in &config.models {
                stage.add_model(Arc::new(CommandModel::new(id.clone(), spec.clone())));
            }
            runner.register(Arc::new(stage));
        }

        let store = match &config.state_file {
            Some(path) if path.exists() => {
                let store = StatusStore::load_snapshot(path)?;
                tracing::info!(path = %path.display(), jobs = store.len(), "Restored job table");
                store
            }
            _ => StatusStore::new(),
        };

        let manager = JobManager::start(config.manager_config(), Arc::new(store), runner)?;
        Ok(Self {
            manager,
            forecasts,
            state_file: config.state_file.clone(),
        })
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn forecasts(&self) -> &Arc<ForecastStore> {
        &self.forecasts
    }

    /// Submit a job of `job_type` with its default stage chain.
    pub fn create_job(&self, job_type: JobType, params: serde_json::Value) -> PipelineResult<JobCreated> {
        self.submit(JobRequest::new(job_type).with_params(params))
    }

    /// Submit a fully specified request.
    pub fn submit(&self, request: JobRequest) -> PipelineResult<JobCreated> {
        let id = self.manager.submit(request)?;
        let record = self.manager.status(&id)?;
        Ok(JobCreated {
            job_id: id,
            state: record.state,
            created_at: record.created_at,
        })
    }

    pub fn get_job(&self, id: &JobId) -> PipelineResult<JobView> {
        self.manager.status(id).map(JobView::from)
    }

    pub fn cancel_job(&self, id: &JobId) -> PipelineResult<CancelAck> {
        self.manager.cancel(id)?;
        Ok(CancelAck {
            job_id: id.clone(),
            state: self.manager.status(id)?.state,
        })
    }

    pub fn get_latest_forecast(&self) -> PipelineResult<Arc<ForecastResult>> {
        self.forecasts.latest()
    }

    pub fn get_forecast(&self, id: &str) -> PipelineResult<Arc<ForecastResult>> {
        self.forecasts
            .get(id)
            .ok_or_else(|| PipelineError::ForecastUnavailable(format!("forecast {id} not found")))
    }

    /// Retained forecasts, newest first.
    pub fn list_forecasts(&self, limit: usize) -> Vec<Arc<ForecastResult>> {
        self.forecasts.list(limit)
    }

    pub fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Vec<JobView> {
        self.manager
            .list(state, limit)
            .into_iter()
            .map(JobView::from)
            .collect()
    }

    pub fn statistics(&self) -> ManagerStatistics {
        self.manager.statistics()
    }

    /// Persist the job table to the configured state file, if any.
    pub fn save_state(&self) -> PipelineResult<()> {
        if let Some(path) = &self.state_file {
            self.manager.store().save_snapshot(path)?;
            tracing::info!(path = %path.display(), "Saved job table");
        }
        Ok(())
    }

    /// Stop the manager, wait for its workers and persist the job table.
    pub async fn shutdown(&self) -> PipelineResult<()> {
        self.manager.shutdown().await;
        self.save_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::ModelOutput;
    use crate::error::ErrorKind;
    use crate::forecast::{ForecastModel, ModelRequest};
    use crate::job::{STAGE_COLLECT, STAGE_PREPROCESS};
    use crate::manager::{AdmissionPolicy, ManagerConfig};
    use crate::stage::{Stage, StageContext, StageOutput};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    struct PassStage(&'static str);

    #[async_trait]
    impl Stage for PassStage {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &StageContext, input: &ArtifactRef) -> PipelineResult<StageOutput> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(StageOutput::new(ArtifactRef::new(format!("{input}+{}", self.0))))
        }
    }

    /// Hourly series `first, first + step, ...` over the requested lead time.
    struct RampModel {
        id: &'static str,
        first: f64,
        step: f64,
    }

    #[async_trait]
    impl ForecastModel for RampModel {
        fn id(&self) -> &str {
            self.id
        }

        async fn predict(&self, request: &ModelRequest) -> PipelineResult<ModelOutput> {
            let values: Vec<f64> = (0..request.lead_hours)
                .map(|i| self.first + self.step * f64::from(i))
                .collect();
            Ok(ModelOutput::hourly(
                self.id,
                request.base_time + Duration::hours(1),
                &values,
            ))
        }
    }

    fn service(models: Vec<Arc<dyn ForecastModel>>) -> ForecastService {
        let forecasts = Arc::new(ForecastStore::default());
        let mut stage = ForecastStage::new(ForecastEnsembleEngine::default(), Arc::clone(&forecasts));
        for model in models {
            stage.add_model(model);
        }
        let runner = StageRunner::new()
            .with_stage(PassStage(STAGE_COLLECT))
            .with_stage(PassStage(STAGE_PREPROCESS))
            .with_stage(stage);
        let config = ManagerConfig {
            max_concurrent_jobs: 2,
            admission: AdmissionPolicy::Queue { capacity: 2 },
            ..ManagerConfig::default()
        };
        let manager = JobManager::start(config, Arc::new(StatusStore::new()), runner).unwrap();
        ForecastService::new(manager, forecasts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_publishes_latest_forecast() {
        let svc = service(vec![
            Arc::new(RampModel { id: "catboost", first: 40.0, step: 1.0 }),
            Arc::new(RampModel { id: "tcn_48h", first: 50.0, step: 0.0 }),
            Arc::new(RampModel { id: "tcn_72h", first: 60.0, step: 0.0 }),
        ]);
        assert!(matches!(
            svc.get_latest_forecast(),
            Err(PipelineError::ForecastUnavailable(_))
        ));

        let base = Utc.with_ymd_and_hms(2025, 3, 10, 6, 0, 0).unwrap();
        let created = svc
            .create_job(JobType::Pipeline, serde_json::json!({ "base_time": base.to_rfc3339() }))
            .unwrap();
        assert_eq!(created.state, JobState::Pending);

        let record = svc.manager().wait(&created.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);

        let view = svc.get_job(&created.job_id).unwrap();
        assert_eq!(view.last_completed_stage, Some(2));
        assert!((view.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(view.history.len(), 3);

        let forecast = svc.get_latest_forecast().unwrap();
        assert_eq!(
            view.result_ref.unwrap().as_str(),
            format!("forecast://{}", forecast.id)
        );
        assert_eq!(
            forecast.horizons.iter().map(|h| h.horizon_hours).collect::<Vec<_>>(),
            vec![24, 48, 72]
        );
        let h24 = forecast.horizon(24).unwrap();
        assert_eq!(h24.points.len(), 24);
        assert_eq!(h24.points[0].timestamp, base + Duration::hours(1));
        // Within a horizon, timestamps are hourly without gaps.
        assert!(
            h24.points
                .windows(2)
                .all(|w| w[1].timestamp - w[0].timestamp == Duration::hours(1))
        );
        assert!(!forecast.degraded);
        assert!(svc.get_forecast(&forecast.id).is_ok());

        let again = svc
            .create_job(JobType::Forecast, serde_json::json!({ "base_time": base.to_rfc3339() }))
            .unwrap();
        svc.manager().wait(&again.job_id).await.unwrap();
        let listed = svc.list_forecasts(5);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, svc.get_latest_forecast().unwrap().id);
        assert_eq!(listed[1].id, forecast.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forecast_without_models_fails_job() {
        let svc = service(Vec::new());
        let created = svc.create_job(JobType::Forecast, serde_json::Value::Null).unwrap();
        let record = svc.manager().wait(&created.job_id).await.unwrap();

        assert_eq!(record.state, JobState::Failed);
        let view = svc.get_job(&created.job_id).unwrap();
        let error = view.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StageExecution);
        assert_eq!(error.stage.as_deref(), Some(STAGE_FORECAST));
        assert!(view.result_ref.is_none());
        assert!(svc.get_latest_forecast().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_list() {
        let svc = service(Vec::new());
        let first = svc.create_job(JobType::Collect, serde_json::Value::Null).unwrap();
        let second = svc.create_job(JobType::Preprocess, serde_json::Value::Null).unwrap();
        let third = svc.create_job(JobType::Pipeline, serde_json::Value::Null).unwrap();

        // Two workers: the pipeline job waits in the queue.
        let ack = svc.cancel_job(&third.job_id).unwrap();
        assert_eq!(ack.state, JobState::Cancelled);
        assert!(matches!(
            svc.cancel_job(&third.job_id),
            Err(PipelineError::InvalidState { .. })
        ));

        svc.manager().wait(&first.job_id).await.unwrap();
        svc.manager().wait(&second.job_id).await.unwrap();

        assert_eq!(svc.list_jobs(None, 10).len(), 3);
        let cancelled = svc.list_jobs(Some(JobState::Cancelled), 10);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].job_id, third.job_id);
        assert!(cancelled[0].history.is_empty());
        assert_eq!(svc.list_jobs(Some(JobState::Succeeded), 1).len(), 1);

        assert!(matches!(
            svc.get_job(&JobId::new("job_unknown")),
            Err(PipelineError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_job_view_serializes_for_the_wire() {
        let record = JobRecord::new(JobId::new("job_1"), &JobRequest::new(JobType::Pipeline), 600);
        let json = serde_json::to_value(JobView::from(record)).unwrap();
        assert_eq!(json["job_id"], "job_1");
        assert_eq!(json["job_type"], "pipeline");
        assert_eq!(json["state"], "PENDING");
        assert_eq!(json["progress"], 0.0);
        assert!(json.get("error").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_from_config_runs_command_stages() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("jobs.json");
        let config = PipelineConfig::from_toml(&format!(
            r#"
state_file = "{}"

[stages.collect]
program = "sh"
args = ["-c", "echo raw/$AQI_JOB_ID.csv"]
"#,
            state_file.display()
        ))
        .unwrap();

        let svc = ForecastService::from_config(&config).unwrap();
        let created = svc.create_job(JobType::Collect, serde_json::Value::Null).unwrap();
        let record = svc.manager().wait(&created.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(
            record.output.unwrap().as_str(),
            format!("raw/{}.csv", created.job_id)
        );

        // Only `collect` is configured.
        assert!(matches!(
            svc.create_job(JobType::Pipeline, serde_json::Value::Null),
            Err(PipelineError::Validation(_))
        ));

        svc.shutdown().await.unwrap();
        let restored = StatusStore::load_snapshot(&state_file).unwrap();
        assert_eq!(
            restored.get(&created.job_id).unwrap().state,
            JobState::Succeeded
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_saves_queued_jobs_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("jobs.json");
        let config = PipelineConfig::from_toml(&format!(
            r#"
state_file = "{}"
max_concurrent_jobs = 1
admission = "queue"
queue_capacity = 1
cancel_grace_secs = 1

[stages.collect]
program = "sh"
args = ["-c", "sleep 30"]

[stages.preprocess]
program = "sh"
args = ["-c", "echo clean.parquet"]
"#,
            state_file.display()
        ))
        .unwrap();

        let svc = ForecastService::from_config(&config).unwrap();
        let running = svc.create_job(JobType::Collect, serde_json::Value::Null).unwrap();
        for _ in 0..500 {
            if svc.get_job(&running.job_id).unwrap().state == JobState::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let queued = svc.create_job(JobType::Preprocess, serde_json::Value::Null).unwrap();
        assert_eq!(queued.state, JobState::Pending);

        svc.shutdown().await.unwrap();

        let restored = StatusStore::load_snapshot(&state_file).unwrap();
        let queued = restored.get(&queued.job_id).unwrap();
        assert_eq!(queued.state, JobState::Cancelled);
        assert!(queued.history.is_empty());
        assert_eq!(
            restored.get(&running.job_id).unwrap().state,
            JobState::Cancelled
        );
        assert_eq!(svc.statistics().cancelled, 2);
    }

    #[tokio::test]
    async fn test_forecast_stage_and_models_conflict() {
        let config = PipelineConfig::from_toml(
            r#"
[stages.forecast]
program = "forecast.sh"

[models.catboost]
program = "catboost.sh"
"#,
        )
        .unwrap();
        let err = ForecastService::from_config(&config).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
