use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use formbridge_core::layout::Layout;
use formbridge_daemon::config::DaemonConfig;
use formbridge_daemon::{dry_run, run_daemon};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "formbridge-daemon",
    about = "Form session daemon for the desktop messaging host",
    version
)]
struct Args {
    /// Installation home (defaults to FORMBRIDGE_HOME or the local data directory)
    #[arg(long)]
    home: Option<PathBuf>,

    /// Bind, answer one request, and exit
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// The daemon is spawned with null stdio, so it logs to `<home>/logs/daemon.log`.
fn init_logging(layout: &Layout, log_level: &str) -> Result<()> {
    let log_dir = layout.logs_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(layout.log_file())
        .with_context(|| format!("Failed to open log file {}", layout.log_file().display()))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(log_file)))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let layout = Layout::resolve(args.home.as_deref())?;
    init_logging(&layout, &args.log_level)?;

    let config = DaemonConfig::new(layout);
    if args.dry_run {
        info!("Starting dry run");
        return dry_run(config).await;
    }

    info!(pid = std::process::id(), "Starting formbridge daemon");
    match run_daemon(config).await {
        Ok(reason) => {
            info!(?reason, "Daemon exited");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon failed");
            Err(e)
        }
    }
}
