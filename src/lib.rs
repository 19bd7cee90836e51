//! AQI Orchestrator: job orchestration and forecast ensembling for an
//! air-quality forecasting pipeline.
//!
//! Pipeline work (data collection, preprocessing, forecasting) runs as
//! asynchronous jobs under a concurrency limit, a per-type single-flight
//! rule and a per-job watchdog. The forecast stage combines the hourly
//! predictions of several independent models into one multi-horizon
//! forecast with uncertainty bounds, degrading gracefully when models are
//! missing.
//!
//! # Overview
//!
//! - [`JobManager`] admits, dispatches, times out and cancels jobs
//! - [`StatusStore`] holds job records with per-record locking and retention
//! - [`Stage`] is the capability every pipeline step implements; [`StageRunner`]
//!   enforces its contract and [`CommandStage`] runs an external program
//! - [`ForecastEnsembleEngine`] combines [`ModelOutput`]s into a [`ForecastResult`]
//! - [`ForecastStage`] calls every [`ForecastModel`], combines and publishes
//! - [`ForecastService`] is the transport-agnostic request/response surface
//! - [`PipelineError`] with categorized error variants
//!
//! # Lifecycle
//!
//! ```text
//!   CreateJob ──→ validate ──→ admit ──→ PENDING ──→ RUNNING ──→ SUCCEEDED
//!                    │           │                      │
//!               Validation   Admission /                ├──→ FAILED
//!                            ResourceBusy               ├──→ TIMED_OUT
//!                                                       └──→ CANCELLED
//!
//!   RUNNING:  collect ──artifact──→ preprocess ──artifact──→ forecast
//!                                                              │
//!                                       models ──→ combine ──→ publish
//! ```
//!
//! # Example
//!
//! ```ignore
//! use aqi_orchestrator::{ForecastService, JobType, PipelineConfig};
//!
//! let config = PipelineConfig::load(Some("aqi.toml".as_ref()))?;
//! let service = ForecastService::from_config(&config)?;
//! let created = service.create_job(JobType::Pipeline, serde_json::Value::Null)?;
//! let record = service.manager().wait(&created.job_id).await?;
//! let forecast = service.get_latest_forecast()?;
//! ```

pub mod config;
pub mod ensemble;
pub mod error;
pub mod forecast;
pub mod job;
pub mod manager;
pub mod service;
pub mod stage;
pub mod store;
pub mod telemetry;

pub use config::{AdmissionMode, PipelineConfig};
pub use ensemble::{
    EnsemblePolicy, ForecastEnsembleEngine, ForecastPoint, ForecastResult, HorizonForecast,
    HorizonWeights, ModelOutput, Prediction, UncertaintyPolicy,
};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use forecast::{CommandModel, ForecastModel, ForecastStage, ForecastStore, ModelRequest};
pub use job::{
    ArtifactRef, ErrorDetail, JobId, JobRecord, JobRequest, JobState, JobType, StageResult,
    StageStatus,
};
pub use manager::{AdmissionPolicy, JobManager, JobTimeouts, ManagerConfig, ManagerStatistics};
pub use service::{CancelAck, ForecastService, JobCreated, JobView};
pub use stage::{CommandSpec, CommandStage, Stage, StageContext, StageOutput, StageRunner};
pub use store::StatusStore;
