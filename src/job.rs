//! Job lifecycle types.
//!
//! The job state machine:
//!
//! ```text
//!   submit() ──→ PENDING ──→ RUNNING ──→ SUCCEEDED
//!                  │            │
//!                  │            ├──→ FAILED(kind, message)
//!                  │            │
//!                  │            ├──→ TIMED_OUT
//!                  │            │
//!                  └────────────┴──→ CANCELLED
//! ```
//!
//! **Invariants:**
//! - `submit()` MUST return a job in `PENDING`.
//! - Transitions are monotonic: a job never moves backward.
//! - Terminal states (`SUCCEEDED`, `FAILED`, `TIMED_OUT`, `CANCELLED`) are permanent.
//! - `last_completed_stage` only increases.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PipelineError, PipelineResult};

/// Stage names understood by the default stage chains.
pub const STAGE_COLLECT: &str = "collect";
pub const STAGE_PREPROCESS: &str = "preprocess";
pub const STAGE_FORECAST: &str = "forecast";

/// Dispatch priority bounds; higher runs first.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

fn default_priority() -> u8 {
    MIN_PRIORITY
}

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create a job ID from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, random job ID.
    pub fn generate() -> Self {
        Self(format!("job_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of pipeline job. At most one job per type may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Raw data collection.
    Collect,
    /// Feature preprocessing.
    Preprocess,
    /// Model inference and ensemble combination.
    Forecast,
    /// Composite chain: collect → preprocess → forecast.
    Pipeline,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Collect,
        JobType::Preprocess,
        JobType::Forecast,
        JobType::Pipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Collect => "collect",
            JobType::Preprocess => "preprocess",
            JobType::Forecast => "forecast",
            JobType::Pipeline => "pipeline",
        }
    }

    /// Stage chain used when a request does not name one.
    pub fn default_stages(&self) -> Vec<String> {
        let names: &[&str] = match self {
            JobType::Collect => &[STAGE_COLLECT],
            JobType::Preprocess => &[STAGE_PREPROCESS],
            JobType::Forecast => &[STAGE_FORECAST],
            JobType::Pipeline => &[STAGE_COLLECT, STAGE_PREPROCESS, STAGE_FORECAST],
        };
        names.iter().map(|s| (*s).to_string()).collect()
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::Validation(format!("unknown job type '{s}'")))
    }
}

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Admitted, waiting for a worker.
    Pending,
    /// A worker is executing the stage chain.
    Running,
    /// Every stage finished successfully.
    Succeeded,
    /// A stage failed.
    Failed,
    /// The watchdog fired before the chain finished.
    TimedOut,
    /// Cancelled on request.
    Cancelled,
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// Check if the job is still in flight (pending or running).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self → next` is a legal, forward-only transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Running) => true,
            (JobState::Pending, JobState::Cancelled | JobState::Failed) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::TimedOut => "TIMED_OUT",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Opaque reference to an artifact produced or consumed by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Input handed to the first stage of a job.
    ///
    /// Uses the `input_ref` job parameter when present.
    pub fn initial(id: &JobId, params: &serde_json::Value) -> Self {
        match params.get("input_ref").and_then(|v| v.as_str()) {
            Some(r) => Self::new(r),
            None => Self::new(format!("job://{id}/input")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exit status of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

/// Outcome of one stage execution. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage: String,
    /// Exit status.
    pub status: StageStatus,
    /// Process exit code, when the stage ran an external process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Produced artifact (on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ArtifactRef>,
    /// Captured stdout/stderr or failure text.
    #[serde(default)]
    pub diagnostics: String,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    /// Convert a failed result into the error attached to the job.
    pub fn into_output(self) -> PipelineResult<ArtifactRef> {
        match (self.status, self.output) {
            (StageStatus::Succeeded, Some(output)) => Ok(output),
            (StageStatus::Succeeded, None) => Err(PipelineError::StageExecution {
                stage: self.stage,
                diagnostic: "stage produced no output artifact".into(),
            }),
            (StageStatus::Failed, _) => Err(PipelineError::StageExecution {
                stage: self.stage,
                diagnostic: self.diagnostics,
            }),
        }
    }
}

/// Error attached to a terminal job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    /// Stage that was executing when the error occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ErrorDetail {
    pub fn new(err: &PipelineError, stage: Option<&str>) -> Self {
        let stage = match err {
            PipelineError::StageExecution { stage, .. } => Some(stage.clone()),
            _ => stage.map(str::to_string),
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            stage,
        }
    }
}

/// A job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: JobType,
    /// Explicit stage chain; defaults to [`JobType::default_stages`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<String>>,
    /// Free-form parameters handed to every stage.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Per-job timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Queued jobs with a higher priority are dispatched first.
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl JobRequest {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            stages: None,
            params: serde_json::Value::Null,
            timeout_secs: None,
            priority: MIN_PRIORITY,
        }
    }

    pub fn with_stages(mut self, stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// The stage chain this request will execute.
    pub fn resolved_stages(&self) -> Vec<String> {
        self.stages
            .clone()
            .unwrap_or_else(|| self.job_type.default_stages())
    }
}

/// Durable record of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    /// Ordered stage chain.
    pub stages: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    pub timeout_secs: u64,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Index into `stages` of the last stage that finished successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_stage: Option<usize>,
    /// Every stage execution, in order.
    #[serde(default)]
    pub history: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Output artifact of the final stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ArtifactRef>,
}

impl JobRecord {
    /// Create a `PENDING` record for an admitted request.
    pub fn new(id: JobId, request: &JobRequest, timeout_secs: u64) -> Self {
        Self {
            id,
            job_type: request.job_type,
            stages: request.resolved_stages(),
            params: request.params.clone(),
            timeout_secs,
            priority: request.priority,
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_completed_stage: None,
            history: Vec::new(),
            error: None,
            output: None,
        }
    }

    /// Move to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: JobState) -> PipelineResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidState {
                job: self.id.to_string(),
                state: self.state.to_string(),
            });
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Move to a terminal failure state and attach the error.
    pub fn fail(&mut self, next: JobState, err: &PipelineError) -> PipelineResult<()> {
        let stage = self.current_stage().map(str::to_string);
        self.transition(next)?;
        self.error = Some(ErrorDetail::new(err, stage.as_deref()));
        Ok(())
    }

    /// Append a stage result; successful results advance `last_completed_stage`.
    pub fn record_stage(&mut self, index: usize, result: StageResult) {
        if result.is_success() && self.last_completed_stage.is_none_or(|last| index > last) {
            self.last_completed_stage = Some(index);
            self.output = result.output.clone();
        }
        self.history.push(result);
    }

    /// Name of the stage that would execute next.
    pub fn current_stage(&self) -> Option<&str> {
        let next = self.last_completed_stage.map_or(0, |i| i + 1);
        self.stages.get(next).map(String::as_str)
    }

    /// Number of stages that finished successfully.
    pub fn completed_stages(&self) -> usize {
        self.last_completed_stage.map_or(0, |i| i + 1)
    }
}
