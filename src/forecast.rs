//! Forecast stage: model invocation, combination and publication.
//!
//! ```text
//!   ForecastStage::execute
//!     ├──→ ForecastModel::predict  (one task per model, failures are non-fatal)
//!     ├──→ ForecastEnsembleEngine::combine
//!     └──→ ForecastStore::publish  ──→ "forecast://<id>" output artifact
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::ensemble::{ForecastEnsembleEngine, ForecastResult, ModelOutput};
use crate::error::{PipelineError, PipelineResult};
use crate::job::{ArtifactRef, STAGE_FORECAST};
use crate::stage::{CommandSpec, Stage, StageContext, StageOutput, run_command};

/// Horizons requested when a job does not name its own.
pub const DEFAULT_HORIZONS: [u32; 3] = [24, 48, 72];

/// What a model is asked to predict.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Preprocessed feature artifact.
    pub input: ArtifactRef,
    /// Lead hours are counted from here.
    pub base_time: DateTime<Utc>,
    /// Longest lead time needed, in hours.
    pub lead_hours: u32,
}

/// An external forecasting model.
///
/// Given input features it returns an hourly prediction series. Training
/// and tuning happen elsewhere.
#[async_trait]
pub trait ForecastModel: Send + Sync {
    fn id(&self) -> &str;

    async fn predict(&self, request: &ModelRequest) -> PipelineResult<ModelOutput>;
}

/// Model served by an external process that prints a JSON [`ModelOutput`].
///
/// The process receives `AQI_INPUT_REF`, `AQI_BASE_TIME` (RFC 3339) and
/// `AQI_LEAD_HOURS` in its environment.
#[derive(Debug, Clone)]
pub struct CommandModel {
    id: String,
    spec: CommandSpec,
}

impl CommandModel {
    pub fn new(id: impl Into<String>, spec: CommandSpec) -> Self {
        Self { id: id.into(), spec }
    }
}

#[async_trait]
impl ForecastModel for CommandModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, request: &ModelRequest) -> PipelineResult<ModelOutput> {
        let env = [
            ("AQI_INPUT_REF", request.input.to_string()),
            ("AQI_BASE_TIME", request.base_time.to_rfc3339()),
            ("AQI_LEAD_HOURS", request.lead_hours.to_string()),
        ];
        let out = run_command(&self.spec, &env).await?;
        if out.exit_code != 0 {
            tracing::warn!(
                model = %self.id,
                exit_code = out.exit_code,
                stderr = %out.stderr.trim(),
                "Model process failed"
            );
            return Err(PipelineError::ModelUnavailable {
                horizon_hours: request.lead_hours,
                model: self.id.clone(),
            });
        }
        let mut output: ModelOutput = serde_json::from_str(out.stdout.trim())?;
        output.model_id.clone_from(&self.id);
        Ok(output)
    }
}

/// History of published forecasts, newest last.
///
/// Publishing never overwrites: a new forecast supersedes the previous
/// one, and the oldest entries fall off once `capacity` is reached.
#[derive(Debug)]
pub struct ForecastStore {
    history: RwLock<VecDeque<Arc<ForecastResult>>>,
    capacity: usize,
}

impl Default for ForecastStore {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ForecastStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish a forecast and return its artifact reference.
    pub fn publish(&self, result: ForecastResult) -> ArtifactRef {
        let artifact = ArtifactRef::new(format!("forecast://{}", result.id));
        let mut history = self.history.write();
        history.push_back(Arc::new(result));
        while history.len() > self.capacity {
            history.pop_front();
        }
        artifact
    }

    /// The most recent forecast.
    pub fn latest(&self) -> PipelineResult<Arc<ForecastResult>> {
        self.history
            .read()
            .back()
            .cloned()
            .ok_or_else(|| PipelineError::ForecastUnavailable("no forecast has been published yet".into()))
    }

    /// Look up a forecast by id or by its `forecast://` artifact reference.
    pub fn get(&self, id: &str) -> Option<Arc<ForecastResult>> {
        let id = id.strip_prefix("forecast://").unwrap_or(id);
        self.history.read().iter().rev().find(|f| f.id == id).cloned()
    }

    /// Up to `limit` retained forecasts, newest first.
    pub fn list(&self, limit: usize) -> Vec<Arc<ForecastResult>> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Terminal stage of a forecast job.
///
/// Job parameters:
/// - `base_time`: RFC 3339 start instant (default: the current hour),
/// - `horizons`: array of horizon hours (default: the stage's horizons).
pub struct ForecastStage {
    models: Vec<Arc<dyn ForecastModel>>,
    engine: ForecastEnsembleEngine,
    store: Arc<ForecastStore>,
    horizons: Vec<u32>,
}

impl std::fmt::Debug for ForecastStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let models: Vec<&str> = self.models.iter().map(|m| m.id()).collect();
        f.debug_struct("ForecastStage")
            .field("models", &models)
            .field("horizons", &self.horizons)
            .finish()
    }
}

impl ForecastStage {
    pub fn new(engine: ForecastEnsembleEngine, store: Arc<ForecastStore>) -> Self {
        Self {
            models: Vec::new(),
            engine,
            store,
            horizons: DEFAULT_HORIZONS.to_vec(),
        }
    }

    pub fn with_model(mut self, model: impl ForecastModel + 'static) -> Self {
        self.models.push(Arc::new(model));
        self
    }

    pub fn add_model(&mut self, model: Arc<dyn ForecastModel>) {
        self.models.push(model);
    }

    pub fn with_horizons(mut self, horizons: Vec<u32>) -> Self {
        self.horizons = horizons;
        self
    }

    fn base_time(params: &serde_json::Value) -> PipelineResult<DateTime<Utc>> {
        match params.get("base_time").and_then(|v| v.as_str()) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| PipelineError::Validation(format!("invalid base_time '{raw}': {e}"))),
            None => Utc::now()
                .duration_trunc(Duration::hours(1))
                .map_err(|e| PipelineError::Validation(e.to_string())),
        }
    }

    fn horizons(&self, params: &serde_json::Value) -> PipelineResult<Vec<u32>> {
        let Some(raw) = params.get("horizons") else {
            return Ok(self.horizons.clone());
        };
        serde_json::from_value(raw.clone())
            .map_err(|e| PipelineError::Validation(format!("invalid horizons: {e}")))
    }

    /// Run every model, dropping the ones that fail.
    async fn collect_outputs(&self, request: &ModelRequest) -> Vec<ModelOutput> {
        let mut tasks = JoinSet::new();
        for model in &self.models {
            let model = Arc::clone(model);
            let request = request.clone();
            tasks.spawn(async move {
                let id = model.id().to_string();
                (id, model.predict(&request).await)
            });
        }

        let mut outputs = Vec::with_capacity(self.models.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(output))) => outputs.push(output),
                Ok((id, Err(err))) => {
                    tracing::warn!(model = %id, error = %err, "Model prediction failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Model task panicked");
                }
            }
        }
        // Task completion order is arbitrary.
        outputs.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        outputs
    }
}

#[async_trait]
impl Stage for ForecastStage {
    fn name(&self) -> &str {
        STAGE_FORECAST
    }

    async fn execute(&self, ctx: &StageContext, input: &ArtifactRef) -> PipelineResult<StageOutput> {
        let base_time = Self::base_time(&ctx.params)?;
        let horizons = self.horizons(&ctx.params)?;
        let lead_hours = horizons.iter().copied().max().unwrap_or(0);

        let request = ModelRequest {
            input: input.clone(),
            base_time,
            lead_hours,
        };
        let outputs = self.collect_outputs(&request).await;
        let result = self.engine.combine(base_time, &outputs, &horizons)?;

        let summary = format!(
            "{} of {} horizons from {} models, degraded={}",
            result.horizons.len(),
            horizons.len(),
            result.models.len(),
            result.degraded
        );
        let forecast_id = result.id.clone();
        let degraded = result.degraded;
        let artifact = self.store.publish(result);
        tracing::info!(job_id = %ctx.job_id, forecast_id = %forecast_id, degraded, "Forecast published");

        Ok(StageOutput::new(artifact).with_diagnostics(summary))
    }
}
