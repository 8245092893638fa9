use clap::{Parser, Subcommand};
use dsnapshot::stats::{format_bytes, human_duration};
use dsnapshot::{
    run_snapshot, shutdown_signal, status_report, Config, LogStatus, ProgressBars, RemoteRegistry,
    RunMode, RunSettings, SnapshotError, StatusSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dsnapshot")]
#[command(
    about = "Resumable, hardlink-deduplicating snapshots of a cloud storage account",
    long_about = None
)]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot root directory (must exist)
    #[arg(short, long, global = true)]
    destination: Option<PathBuf>,

    /// Access token, or a pasted redirect URL containing access_token=...
    #[arg(long, env = "DSNAPSHOT_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Remote folder to snapshot (default: whole account)
    #[arg(long, global = true)]
    remote_path: Option<String>,

    /// Storage backend
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Completed snapshots to keep
    #[arg(long, global = true)]
    rotations: Option<usize>,

    /// Log progress lines instead of progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// List the remote and materialize a snapshot (resumes unfinished runs)
    Pull,
    /// Build the remote index only
    Map,
    /// Materialize what the unfinished run has indexed so far
    Resolve,
    /// Show account usage, local snapshots and unfinished run progress
    Status,
}

fn load_config(args: &Args) -> Result<Config, SnapshotError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(destination) = &args.destination {
        config.destination = Some(destination.clone());
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
    if let Some(remote_path) = &args.remote_path {
        config.remote_path = remote_path.clone();
    }
    if let Some(backend) = &args.backend {
        config.backend = backend.clone();
    }
    if args.rotations.is_some() {
        config.rotations = args.rotations;
    }
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dsnapshot={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn pull(
    settings: &RunSettings,
    mode: RunMode,
    progress_bars: bool,
) -> Result<(), SnapshotError> {
    let remote = RemoteRegistry::with_builtin().build(&settings.backend, &settings.remote)?;
    let status: Arc<dyn StatusSink> = if progress_bars {
        Arc::new(ProgressBars::new())
    } else {
        Arc::new(LogStatus::new(Duration::from_secs(10)))
    };

    let report = run_snapshot(settings, remote.as_ref(), mode, status, shutdown_signal()).await?;

    if let Some(resolve) = &report.resolve {
        info!(
            "Resolved: {} downloaded ({}), {} linked, {} hash-linked, {} existing, {} folders",
            resolve.downloaded,
            format_bytes(resolve.bytes_downloaded),
            resolve.linked,
            resolve.hash_linked,
            resolve.existing,
            resolve.folders
        );
    }
    for failed in &report.failed {
        warn!("Not downloaded: {} ({})", failed.path, failed.reason);
    }
    for name in &report.rotated {
        info!("Removed old snapshot {}", name);
    }
    if report.completed {
        info!("✅ Snapshot {} complete: {}", report.timestamp, report.folder.display());
    } else {
        info!("Snapshot {} not complete yet: {}", report.timestamp, report.folder.display());
    }
    Ok(())
}

async fn status(settings: &RunSettings) -> Result<(), SnapshotError> {
    let remote = RemoteRegistry::with_builtin().build(&settings.backend, &settings.remote)?;
    let report = status_report(settings, remote.as_ref()).await?;

    println!("Account:   {} ({})", report.account, report.backend);
    println!("Usage:     {}", format_bytes(report.remote_bytes_used));
    println!("Snapshots: {}", report.snapshots.len());
    for name in &report.snapshots {
        println!("  {}", name);
    }
    match report.unfinished {
        Some(job) => {
            let started =
                chrono::DateTime::from_timestamp_millis(job.start_time).unwrap_or_default();
            let running_for = (chrono::Utc::now() - started).to_std().unwrap_or_default();
            println!(
                "Unfinished {} (started {} ago): indexed {} of {}{}, \
                 resolved {}/{} entries ({}), {} failed",
                job.timestamp,
                human_duration(running_for),
                format_bytes(job.bytes_indexed),
                format_bytes(job.bytes_total),
                if job.map_complete { "" } else { " so far" },
                job.process_index,
                job.map_length,
                format_bytes(job.bytes_processed),
                job.failed.len()
            );
        }
        None => println!("No unfinished snapshot"),
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), SnapshotError> {
    let config = load_config(&args)?;
    let level = if args.verbose { "debug" } else { config.log_level.as_str() };
    init_tracing(level);

    let settings = config.validate()?;
    info!("🚀 dsnapshot {}", env!("CARGO_PKG_VERSION"));
    info!("Destination: {}", settings.destination.display());

    let progress_bars = !args.no_progress && atty::is(atty::Stream::Stderr);
    match args.command {
        Command::Pull => pull(&settings, RunMode::Pull, progress_bars).await,
        Command::Map => pull(&settings, RunMode::MapOnly, progress_bars).await,
        Command::Resolve => pull(&settings, RunMode::ResolveOnly, progress_bars).await,
        Command::Status => status(&settings).await,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
