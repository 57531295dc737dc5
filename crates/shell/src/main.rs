//! Bundle shell: the outer binary that keeps the application bundle
//! installed, verified, and running.

use anyhow::{Context, Result};
use bundle_engine::{
    DownloadResult, EngineConfig, HttpFetcher, LaunchOutcome, Platform, ProcessLauncher,
    RetryPolicy, UpdateEngine,
};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line arguments for the bundle shell
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Root directory for application data
    #[arg(long)]
    app_data_dir: PathBuf,

    /// Subdirectory of the app data dir holding bundle state (may be empty)
    #[arg(long, default_value = "")]
    bundle_subdirectory: String,

    /// Update server base URL (http(s):// or file://)
    #[arg(long)]
    base_url: String,

    /// Base64 Ed25519 public key manifests must be signed with
    #[arg(long)]
    public_key: String,

    /// Version of this shell, checked against the manifest's minimum
    #[arg(long, default_value_t = 1)]
    shell_version: u32,

    /// Target platform, e.g. "linux-x64" (auto-detected by default)
    #[arg(long)]
    platform: Option<String>,

    /// Seconds between background update checks
    #[arg(long, default_value_t = 3600)]
    check_interval_secs: u64,

    /// First retry delay in seconds
    #[arg(long, default_value_t = 1)]
    retry_initial_delay_secs: u64,

    /// Retry delay ceiling in seconds
    #[arg(long, default_value_t = 60)]
    retry_max_delay_secs: u64,

    /// Retry delay multiplier
    #[arg(long, default_value_t = 2.0)]
    retry_multiplier: f64,

    /// Maximum retries for a retryable failure
    #[arg(long, default_value_t = 3)]
    retry_max_attempts: u32,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Subcommands for the bundle shell
#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the installed bundle and launch it (the default)
    Run,
    /// Run one update check without launching, as the background updater does
    Check,
}

fn engine_config(args: &Args) -> Result<EngineConfig> {
    let base_url = Url::parse(&args.base_url)
        .with_context(|| format!("invalid base URL {:?}", args.base_url))?;
    let public_key =
        bundle_engine::parse_public_key(&args.public_key).context("invalid public key")?;
    let platform = match &args.platform {
        Some(value) => value
            .parse::<Platform>()
            .with_context(|| format!("invalid platform {value:?}"))?,
        None => Platform::detect().context("platform detection failed")?,
    };
    Ok(EngineConfig::new(
        args.app_data_dir.clone(),
        base_url,
        public_key,
        args.shell_version,
        platform,
    )
    .bundle_subdirectory(args.bundle_subdirectory.clone())
    .check_interval(Duration::from_secs(args.check_interval_secs))
    .retry(RetryPolicy {
        initial_delay: Duration::from_secs(args.retry_initial_delay_secs),
        max_delay: Duration::from_secs(args.retry_max_delay_secs),
        multiplier: args.retry_multiplier,
        max_attempts: args.retry_max_attempts,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = engine_config(&args)?;
    let fetcher = HttpFetcher::builder()
        .base_url(config.base_url.clone())
        .build()
        .context("failed to build fetcher")?;
    let (engine, mut events) = UpdateEngine::new(config, fetcher)?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!("{event}");
        }
    });

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let launcher = ProcessLauncher::new();
            match engine.validate_and_launch(&launcher).await {
                LaunchOutcome::Exited(code) => std::process::exit(code),
                LaunchOutcome::ShellUpdateRequired => {
                    eprintln!("This shell is too old to run the available bundle.");
                    std::process::exit(64);
                }
                LaunchOutcome::Failed => std::process::exit(1),
            }
        }
        Commands::Check => match engine.check_and_download().await {
            DownloadResult::Success | DownloadResult::AlreadyUpToDate => Ok(()),
            DownloadResult::Cancelled => std::process::exit(130),
            DownloadResult::Failed(err) => Err(err.into()),
        },
    }
}
