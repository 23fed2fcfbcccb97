use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use runwatch::config::{
    self, Settings, TrackingConfig, DEFAULT_EXPERIMENT_NAME, DEFAULT_TRACKING_URI,
};
use runwatch::emitter::RetryPolicy;
use runwatch::lifecycle::{self, signal};
use runwatch::sampler::{DatasetSampler, Sampler, Strategy, SystemSampler};
use runwatch::tracking::{DryRunClient, MlflowClient, Params, StartRunOptions, TrackingClient};

/// Records host utilisation or dataset growth of a job as an experiment run.
#[derive(Parser)]
#[command(name = "runwatch", about)]
struct Cli {
    /// Base URI of the MLflow tracking server.
    #[arg(long, global = true, env = "MLFLOW_TRACKING_URI", default_value = DEFAULT_TRACKING_URI)]
    tracking_uri: String,

    /// Experiment the run is created in.
    #[arg(long, global = true, env = "MLFLOW_EXPERIMENT_NAME", default_value = DEFAULT_EXPERIMENT_NAME)]
    experiment: String,

    /// Name for the run; the server picks one if omitted.
    #[arg(long, global = true)]
    run_name: Option<String>,

    /// Accept invalid TLS certificates from the tracking server.
    #[arg(long, global = true, env = "MLFLOW_TRACKING_INSECURE_TLS")]
    insecure_tls: bool,

    /// Basic auth username for the tracking server.
    #[arg(long, global = true, env = "MLFLOW_TRACKING_USERNAME")]
    username: Option<String>,

    /// Basic auth password for the tracking server.
    #[arg(long, global = true, env = "MLFLOW_TRACKING_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Bearer token for the tracking server.
    #[arg(long, global = true, env = "MLFLOW_TRACKING_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Per-request timeout for tracking calls, in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Attempts per metric before an emission error is fatal.
    #[arg(long, global = true, default_value_t = 1)]
    emit_attempts: u32,

    /// Log tracking calls instead of sending them.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record CPU, memory and disk utilisation every 2s.
    System {
        /// YAML configuration of the monitored job, logged as run parameters.
        #[arg(long, visible_alias = "config_path")]
        config_path: PathBuf,
    },
    /// Record the size of the job's output directory every 10s.
    Dataset {
        /// YAML configuration of the monitored job, logged as run parameters.
        #[arg(long, visible_alias = "config_path")]
        config_path: PathBuf,

        /// Directory the job writes its output to.
        #[arg(long, visible_alias = "output_path")]
        output_path: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via the GIT_COMMIT env var.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            experiment_name: self.experiment.clone(),
            run_name: self.run_name.clone(),
            tracking: TrackingConfig {
                tracking_uri: self.tracking_uri.clone(),
                insecure_tls: self.insecure_tls,
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                username: self.username.clone(),
                password: self.password.clone(),
                token: self.token.clone(),
            },
            retry: RetryPolicy::with_attempts(self.emit_attempts),
            dry_run: self.dry_run,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, strategy) = match &cli.command {
        Command::Version => {
            println!("runwatch {}", version::full());
            return Ok(());
        }
        Command::System { config_path } => {
            (config_path.clone(), Strategy::System(SystemSampler::new()))
        }
        Command::Dataset {
            config_path,
            output_path,
        } => (
            config_path.clone(),
            Strategy::Dataset(DatasetSampler::new(output_path)),
        ),
    };

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let settings = cli.settings();
    settings.validate().context("invalid settings")?;

    let params = config::load_params(&config_path)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        sampler = strategy.name(),
        experiment = %settings.experiment_name,
        dry_run = settings.dry_run,
        params = params.len(),
        "starting runwatch",
    );

    let mut tags = BTreeMap::new();
    tags.insert(
        "runwatch.config_path".to_string(),
        config_path.display().to_string(),
    );
    if let Strategy::Dataset(dataset) = &strategy {
        tags.insert(
            "runwatch.output_path".to_string(),
            dataset.output_path().display().to_string(),
        );
    }
    let opts = StartRunOptions {
        run_name: settings.run_name.clone(),
        log_system_metrics: strategy.reports_system_metrics(),
        tags,
    };

    // One logical thread: the loop and the signal listener share it.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = rt.block_on(run(settings, strategy, opts, params));

    // A directory walk still running on the blocking pool must not keep the
    // process alive once the run is closed.
    rt.shutdown_background();

    result
}

async fn run(
    settings: Settings,
    strategy: Strategy,
    opts: StartRunOptions,
    params: Params,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let _listener = signal::spawn_listener(cancel.clone())?;

    if settings.dry_run {
        let client = Arc::new(DryRunClient::new());
        monitor(client, &settings, strategy, &opts, &params, cancel).await?;
    } else {
        let client = Arc::new(MlflowClient::new(&settings.tracking)?);
        monitor(client, &settings, strategy, &opts, &params, cancel).await?;
    }

    tracing::info!("runwatch stopped");

    Ok(())
}

async fn monitor<C: TrackingClient>(
    client: Arc<C>,
    settings: &Settings,
    strategy: Strategy,
    opts: &StartRunOptions,
    params: &Params,
    cancel: CancellationToken,
) -> Result<()> {
    lifecycle::monitor(
        client,
        strategy,
        settings.retry,
        &settings.experiment_name,
        opts,
        params,
        cancel,
    )
    .await
}
