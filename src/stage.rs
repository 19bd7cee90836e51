//! Stage capability and runner.
//!
//! ```text
//!   JobManager ──→ StageRunner::run(name, input) ──→ Stage::execute(ctx, input)
//!                        │                                  │
//!                        └──────── StageResult ◀────────────┘
//! ```
//!
//! The runner never interprets what a stage does. It looks the stage up by
//! name, executes it on its own task, and turns every outcome (success,
//! error, panic) into a [`StageResult`]. Dropping the future returned by
//! [`StageRunner::run`] aborts the stage task, which is how the watchdog and
//! forced cancellation stop an in-flight stage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::job::{ArtifactRef, JobId, JobType, StageResult, StageStatus};

/// Captured process output kept on a stage result.
const MAX_DIAGNOSTIC_LEN: usize = 4_000;

/// Per-execution context handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// Parameters from the job request.
    pub params: serde_json::Value,
    /// Fires when the job is cancelled; stages may stop early on it.
    pub cancel: CancellationToken,
}

/// What a successful stage hands back.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub artifact: ArtifactRef,
    pub diagnostics: String,
    pub exit_code: Option<i32>,
}

impl StageOutput {
    pub fn new(artifact: ArtifactRef) -> Self {
        Self {
            artifact,
            diagnostics: String::new(),
            exit_code: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = diagnostics.into();
        self
    }
}

/// One named unit of pipeline work.
///
/// A stage consumes an input artifact reference and produces an output
/// artifact reference, or fails with a diagnostic.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in stage chains.
    fn name(&self) -> &str;

    /// Execute the stage.
    async fn execute(&self, ctx: &StageContext, input: &ArtifactRef)
    -> PipelineResult<StageOutput>;
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Registry of stages plus the execution contract around them.
#[derive(Default, Clone)]
pub struct StageRunner {
    stages: FxHashMap<String, Arc<dyn Stage>>,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl StageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own name, replacing any previous one.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.name().to_string(), stage);
        self
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.register(Arc::new(stage));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run one stage to completion.
    ///
    /// Never fails: errors and panics inside the stage come back as a
    /// `Failed` result carrying the diagnostic text.
    pub async fn run(&self, stage_name: &str, input: ArtifactRef, ctx: StageContext) -> StageResult {
        let started = tokio::time::Instant::now();
        let job_id = ctx.job_id.clone();

        let Some(stage) = self.stages.get(stage_name).cloned() else {
            return failed(stage_name, started, format!("stage '{stage_name}' is not registered"));
        };

        tracing::debug!(job_id = %job_id, stage = stage_name, input = %input, "Stage started");

        let mut task = AbortOnDrop(tokio::spawn(async move { stage.execute(&ctx, &input).await }));
        let result = match (&mut task.0).await {
            Ok(Ok(output)) => StageResult {
                stage: stage_name.to_string(),
                status: StageStatus::Succeeded,
                exit_code: output.exit_code,
                duration_ms: elapsed_ms(started),
                output: Some(output.artifact),
                diagnostics: output.diagnostics,
                finished_at: Utc::now(),
            },
            Ok(Err(err)) => {
                let diagnostic = match err {
                    PipelineError::StageExecution { diagnostic, .. } => diagnostic,
                    other => other.to_string(),
                };
                failed(stage_name, started, diagnostic)
            }
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".into());
                failed(stage_name, started, format!("stage panicked: {msg}"))
            }
            Err(_) => failed(stage_name, started, "stage task aborted".into()),
        };

        if result.is_success() {
            tracing::info!(
                job_id = %job_id,
                stage = stage_name,
                elapsed_ms = result.duration_ms,
                "Stage finished"
            );
        } else {
            tracing::warn!(
                job_id = %job_id,
                stage = stage_name,
                elapsed_ms = result.duration_ms,
                diagnostic = %result.diagnostics,
                "Stage failed"
            );
        }
        result
    }
}

fn elapsed_ms(started: tokio::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn failed(stage: &str, started: tokio::time::Instant, diagnostics: String) -> StageResult {
    StageResult {
        stage: stage.to_string(),
        status: StageStatus::Failed,
        exit_code: None,
        duration_ms: elapsed_ms(started),
        output: None,
        diagnostics,
        finished_at: Utc::now(),
    }
}

/// External program invocation, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable to run.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Fixed output artifact. When unset, the last non-empty stdout line is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            output_ref: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Captured result of a finished child process.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `spec` with extra environment, killing the child if the returned
/// future is dropped.
pub(crate) async fn run_command(
    spec: &CommandSpec,
    extra_env: &[(&str, String)],
) -> PipelineResult<CommandOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn()?;
    let output = child.wait_with_output().await?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let start = (text.len() - max..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());
    &text[start..]
}

/// Stage backed by an external process.
///
/// The process receives `AQI_JOB_ID`, `AQI_INPUT_REF` and `AQI_JOB_PARAMS`
/// (JSON) in its environment.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    spec: CommandSpec,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext, input: &ArtifactRef) -> PipelineResult<StageOutput> {
        let env = [
            ("AQI_JOB_ID", ctx.job_id.to_string()),
            ("AQI_INPUT_REF", input.to_string()),
            ("AQI_JOB_PARAMS", serde_json::to_string(&ctx.params)?),
        ];
        let out = run_command(&self.spec, &env)
            .await
            .map_err(|e| PipelineError::StageExecution {
                stage: self.name.clone(),
                diagnostic: format!("failed to run '{}': {e}", self.spec.program),
            })?;

        let diagnostics = tail(&format!("{}{}", out.stdout, out.stderr), MAX_DIAGNOSTIC_LEN).to_string();
        if out.exit_code != 0 {
            return Err(PipelineError::StageExecution {
                stage: self.name.clone(),
                diagnostic: format!("exit code {}: {}", out.exit_code, tail(out.stderr.trim(), MAX_DIAGNOSTIC_LEN)),
            });
        }

        let artifact = match &self.spec.output_ref {
            Some(fixed) => ArtifactRef::new(fixed.clone()),
            None => out
                .stdout
                .lines()
                .map(str::trim)
                .rfind(|l| !l.is_empty())
                .map(ArtifactRef::new)
                .ok_or_else(|| PipelineError::StageExecution {
                    stage: self.name.clone(),
                    diagnostic: "process printed no output artifact".into(),
                })?,
        };

        Ok(StageOutput {
            artifact,
            diagnostics,
            exit_code: Some(out.exit_code),
        })
    }
}
