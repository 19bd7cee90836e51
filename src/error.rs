//! Orchestration error types.
//!
//! Errors are categorized by who can act on them:
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | **Submission** | `Validation`, `Admission`, `ResourceBusy` | Fix input or retry later |
//! | **Job-level** | `StageExecution`, `Timeout`, `Cancelled` | Recorded on the job, resubmit |
//! | **Forecast** | `ModelUnavailable`, `ForecastUnavailable` | Degrade or wait for the next run |
//! | **Lookup** | `JobNotFound`, `InvalidState` | Caller error |
//! | **Infrastructure** | `Configuration`, `Io`, `Serialization` | Fix configuration / environment |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while orchestrating pipeline jobs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    // ── Submission errors ────────────────────────────────────────────
    /// Malformed submission parameters, rejected before admission.
    #[error("Invalid job request: {0}")]
    Validation(String),

    /// Concurrency capacity exceeded.
    #[error("Job rejected: {0}")]
    Admission(String),

    /// Another job of the same type is already in flight.
    #[error("A {0} job is already in flight")]
    ResourceBusy(String),

    // ── Job-level errors ─────────────────────────────────────────────
    /// A stage signaled failure.
    #[error("Stage '{stage}' failed: {diagnostic}")]
    StageExecution {
        /// Name of the failing stage.
        stage: String,
        /// Captured diagnostic text.
        diagnostic: String,
    },

    /// The job watchdog fired.
    #[error("Job timed out: {0}")]
    Timeout(String),

    /// The job was cancelled on request.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    // ── Forecast errors ──────────────────────────────────────────────
    /// A model produced no usable output for a horizon (non-fatal).
    #[error("Model '{model}' unavailable for {horizon_hours}h horizon")]
    ModelUnavailable {
        /// Horizon bucket in hours.
        horizon_hours: u32,
        /// Model identifier.
        model: String,
    },

    /// No usable model output for any requested horizon.
    #[error("Forecast unavailable: {0}")]
    ForecastUnavailable(String),

    // ── Lookup errors ────────────────────────────────────────────────
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Operation not valid in the job's current state.
    #[error("Job {job} is {state}")]
    InvalidState {
        /// Job identifier.
        job: String,
        /// Current state of the job.
        state: String,
    },

    // ── Infrastructure errors ────────────────────────────────────────
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serializable error classification stored on job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Admission,
    ResourceBusy,
    StageExecution,
    Timeout,
    Cancelled,
    ModelUnavailable,
    ForecastUnavailable,
    NotFound,
    InvalidState,
    Internal,
}

impl PipelineError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Admission(_) => ErrorKind::Admission,
            Self::ResourceBusy(_) => ErrorKind::ResourceBusy,
            Self::StageExecution { .. } => ErrorKind::StageExecution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::ForecastUnavailable(_) => ErrorKind::ForecastUnavailable,
            Self::JobNotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Configuration(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if resubmitting the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Admission(_) | Self::ResourceBusy(_) | Self::Timeout(_)
        )
    }
}

/// Result type for orchestration operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
