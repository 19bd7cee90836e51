//! `aqi-orchestrator`: run pipeline jobs from a configuration file.
//!
//! ```text
//!   aqi-orchestrator --config aqi.toml run pipeline --params '{"base_time":"2025-06-01T00:00:00Z"}'
//!   aqi-orchestrator --config aqi.toml config
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use aqi_orchestrator::{
    ForecastService, JobRequest, JobState, JobType, PipelineConfig, PipelineError, PipelineResult,
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "aqi-orchestrator")]
#[command(about = "Air-quality pipeline job orchestrator")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "AQI_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "AQI_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job to completion and print its final record
    Run {
        /// collect, preprocess, forecast or pipeline
        job_type: String,

        /// Job parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Explicit stage chain, comma separated
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,

        /// Timeout override in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&std::path::Path>) -> PipelineResult<PipelineConfig> {
    let mut config = PipelineConfig::load(path)?;
    config.apply_process_env()?;
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> PipelineResult<bool> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(true)
        }
        Command::Run {
            job_type,
            params,
            stages,
            timeout,
        } => {
            let job_type: JobType = job_type.parse()?;
            let params = match params {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| PipelineError::Validation(format!("--params: {e}")))?,
                None => serde_json::Value::Null,
            };

            let mut request = JobRequest::new(job_type).with_params(params);
            if !stages.is_empty() {
                request = request.with_stages(stages);
            }
            if let Some(secs) = timeout {
                request = request.with_timeout_secs(secs);
            }

            let service = ForecastService::from_config(&config)?;
            let created = service.submit(request)?;
            let record = service.manager().wait(&created.job_id).await?;
            let view = service.get_job(&record.id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);

            if let Some(forecast) = view
                .result_ref
                .as_ref()
                .and_then(|r| service.get_forecast(r.as_str()).ok())
            {
                println!("{}", serde_json::to_string_pretty(forecast.as_ref())?);
            }

            service.shutdown().await?;
            Ok(record.state == JobState::Succeeded)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    telemetry::init(args.json_logs);

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = %err, kind = ?err.kind(), "aqi-orchestrator failed");
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}
