//! Orchestrator configuration.
//!
//! Resolution order, lowest to highest priority:
//!
//! | Source | Example |
//! |--------|---------|
//! | Built-in defaults | `max_concurrent_jobs = 3` |
//! | TOML file | `aqi-orchestrator.toml` |
//! | Environment | `AQI_MAX_CONCURRENT_JOBS=5` |
//!
//! ```toml
//! max_concurrent_jobs = 3
//! admission = "queue"
//! queue_capacity = 8
//! job_timeout_secs = 7200
//!
//! [job_timeouts]
//! collect = 1800
//! preprocess = 3600
//!
//! [stages.collect]
//! program = "python"
//! args = ["-m", "pipeline.collect"]
//!
//! [models.catboost]
//! program = "python"
//! args = ["-m", "models.catboost_predict"]
//!
//! [[ensemble.weights]]
//! hours = 24
//! models = { catboost = 0.6, tcn_48h = 0.25, tcn_72h = 0.15 }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ensemble::EnsemblePolicy;
use crate::error::{PipelineError, PipelineResult};
use crate::forecast::DEFAULT_HORIZONS;
use crate::manager::{AdmissionPolicy, JobTimeouts, ManagerConfig};
use crate::stage::CommandSpec;

/// How submissions beyond the concurrency limit are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    #[default]
    Reject,
    Queue,
}

impl FromStr for AdmissionMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> PipelineResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(AdmissionMode::Reject),
            "queue" => Ok(AdmissionMode::Queue),
            other => Err(PipelineError::Configuration(format!(
                "unknown admission policy '{other}' (expected 'reject' or 'queue')"
            ))),
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_jobs: usize,
    pub admission: AdmissionMode,
    /// Extra `PENDING` slots when `admission = "queue"`.
    pub queue_capacity: usize,
    pub job_timeout_secs: u64,
    /// Default watchdog per job type, capped by `job_timeout_secs`.
    pub job_timeouts: JobTimeouts,
    pub cancel_grace_secs: u64,
    pub retention_secs: u64,
    pub prune_interval_secs: u64,
    /// Number of published forecasts kept.
    pub forecast_history: usize,
    /// Horizons (hours) requested by the forecast stage.
    pub horizons: Vec<u32>,
    /// Where the status table is persisted between runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    pub stages: BTreeMap<String, CommandSpec>,
    pub models: BTreeMap<String, CommandSpec>,
    pub ensemble: EnsemblePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            admission: AdmissionMode::Reject,
            queue_capacity: 10,
            job_timeout_secs: 7_200,
            job_timeouts: JobTimeouts::default(),
            cancel_grace_secs: 10,
            retention_secs: 86_400,
            prune_interval_secs: 300,
            forecast_history: 10,
            horizons: DEFAULT_HORIZONS.to_vec(),
            state_file: None,
            stages: BTreeMap::new(),
            models: BTreeMap::new(),
            ensemble: EnsemblePolicy::default(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> PipelineResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::Configuration(format!("{key}: cannot parse '{value}'")))
}

impl PipelineConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> PipelineResult<Self> {
        toml::from_str(content).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// Load from a TOML file; `None` gives the defaults.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let Some(path) = path else {
            tracing::debug!("No config file given, using defaults");
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `AQI_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> PipelineResult<()> {
        if let Some(v) = lookup("AQI_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = parse_env("AQI_MAX_CONCURRENT_JOBS", &v)?;
        }
        if let Some(v) = lookup("AQI_ADMISSION_POLICY") {
            self.admission = v.parse()?;
        }
        if let Some(v) = lookup("AQI_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env("AQI_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("AQI_JOB_TIMEOUT_SECS") {
            self.job_timeout_secs = parse_env("AQI_JOB_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("AQI_CANCEL_GRACE_SECS") {
            self.cancel_grace_secs = parse_env("AQI_CANCEL_GRACE_SECS", &v)?;
        }
        if let Some(v) = lookup("AQI_JOB_RETENTION_SECS") {
            self.retention_secs = parse_env("AQI_JOB_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("AQI_PRUNE_INTERVAL_SECS") {
            self.prune_interval_secs = parse_env("AQI_PRUNE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("AQI_FORECAST_HISTORY") {
            self.forecast_history = parse_env("AQI_FORECAST_HISTORY", &v)?;
        }
        if let Some(v) = lookup("AQI_STATE_FILE") {
            self.state_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> PipelineResult<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.manager_config().validate()?;
        if self.forecast_history == 0 {
            return Err(PipelineError::Configuration(
                "forecast_history must be at least 1".into(),
            ));
        }
        if self.horizons.is_empty() || self.horizons.contains(&0) {
            return Err(PipelineError::Configuration(
                "horizons must be a non-empty list of positive hours".into(),
            ));
        }
        if let Some((name, _)) = self
            .stages
            .iter()
            .chain(&self.models)
            .find(|(_, spec)| spec.program.trim().is_empty())
        {
            return Err(PipelineError::Configuration(format!(
                "command for '{name}' has no program"
            )));
        }
        self.ensemble.validate()
    }

    /// Settings for the [`JobManager`](crate::manager::JobManager).
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            admission: match self.admission {
                AdmissionMode::Reject => AdmissionPolicy::Reject,
                AdmissionMode::Queue => AdmissionPolicy::Queue {
                    capacity: self.queue_capacity,
                },
            },
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            type_timeouts: self.job_timeouts,
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            retention: Duration::from_secs(self.retention_secs),
            prune_interval: Duration::from_secs(self.prune_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.job_timeout_secs, 7_200);
        assert_eq!(config.horizons, vec![24, 48, 72]);
        assert!(config.validate().is_ok());
        assert_eq!(config.manager_config().admission, AdmissionPolicy::Reject);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aqi.toml");
        std::fs::write(
            &path,
            r#"
max_concurrent_jobs = 5
admission = "queue"
queue_capacity = 4

[job_timeouts]
collect = 900

[stages.collect]
program = "python"
args = ["-m", "pipeline.collect"]

[models.catboost]
program = "python"
args = ["predict.py"]
env = { MODEL_DIR = "/srv/models" }

[[ensemble.weights]]
hours = 24
models = { catboost = 1.0 }
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(
            config.manager_config().admission,
            AdmissionPolicy::Queue { capacity: 4 }
        );
        assert_eq!(config.stages["collect"].args, vec!["-m", "pipeline.collect"]);
        assert_eq!(config.models["catboost"].env["MODEL_DIR"], "/srv/models");
        assert_eq!(config.ensemble.weights.len(), 1);
        let manager = config.manager_config();
        assert_eq!(manager.timeout_for(JobType::Collect), 900);
        // Unset fields keep their defaults.
        assert_eq!(manager.timeout_for(JobType::Preprocess), 3_600);
        assert_eq!(config.cancel_grace_secs, 10);
        assert_eq!(config.ensemble.uncertainty.z, 1.96);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = PipelineConfig::load(Some(Path::new("/nonexistent/aqi.toml"))).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = PipelineConfig::from_toml("max_concurrent_jobs = 5").unwrap();
        config
            .apply_env(env(&[
                ("AQI_MAX_CONCURRENT_JOBS", "2"),
                ("AQI_ADMISSION_POLICY", "Queue"),
                ("AQI_QUEUE_CAPACITY", "7"),
                ("AQI_JOB_TIMEOUT_SECS", "1800"),
            ]))
            .unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.job_timeout_secs, 1_800);
        assert_eq!(
            config.manager_config().admission,
            AdmissionPolicy::Queue { capacity: 7 }
        );
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(env(&[("AQI_MAX_CONCURRENT_JOBS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("AQI_MAX_CONCURRENT_JOBS"));

        let err = config
            .apply_env(env(&[("AQI_ADMISSION_POLICY", "drop")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_validation() {
        let zero = PipelineConfig {
            max_concurrent_jobs: 0,
            ..PipelineConfig::default()
        };
        assert!(zero.validate().is_err());

        let no_timeout = PipelineConfig {
            job_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        assert!(no_timeout.validate().is_err());

        let bad_weights = PipelineConfig::from_toml(
            "[[ensemble.weights]]\nhours = 24\nmodels = { catboost = -1.0 }",
        )
        .unwrap();
        assert!(bad_weights.validate().is_err());

        let mut empty_program = PipelineConfig::default();
        empty_program
            .stages
            .insert("collect".into(), CommandSpec::new(" "));
        assert!(empty_program.validate().is_err());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            PipelineConfig::from_toml("max_concurrent_jobs = \"three\""),
            Err(PipelineError::Configuration(_))
        ));
    }
}
