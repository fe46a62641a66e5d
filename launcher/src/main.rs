use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use formbridge_core::layout::Layout;
use formbridge_ipc::port_file::PortFile;
use tracing::{debug, info};

mod browser;
mod daemon;
mod discovery;

use daemon::ProcessSpawner;
use discovery::{find_or_start, HttpDaemonLink};

/// Formbridge launcher
///
/// Invoked by the messaging host to open a form session in the browser.
#[derive(Parser, Debug)]
#[command(name = "formbridge", author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Installation home (defaults to FORMBRIDGE_HOME or the local data directory)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Without a command, run the daemon's dry run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a form session with the host's arguments
    Open {
        /// Host arguments, passed to the daemon unchanged
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Ask the running daemon to shut down
    Stop,
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

async fn open(layout: &Layout, home: Option<PathBuf>, args: &[String]) -> Result<()> {
    let link = HttpDaemonLink::new(PortFile::new(layout.port_file()))?;
    let spawner = ProcessSpawner::new(daemon::daemon_binary_path()?, home);

    let url = find_or_start(&link, &spawner, args)
        .await
        .context("Failed to open form session")?;
    info!("Session ready at {}", url.green());
    browser::open_url(&url)
}

async fn stop(layout: &Layout) -> Result<()> {
    let link = HttpDaemonLink::new(PortFile::new(layout.port_file()))?;
    if link.stop().await? {
        info!("Daemon {}", "stopping".green());
    } else {
        info!("Daemon is {}", "not running".yellow());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let layout = Layout::resolve(cli.home.as_deref())?;
    debug!("Using home {}", layout.home().display());

    match cli.command {
        Some(Commands::Open { args }) => open(&layout, cli.home, &args).await,
        Some(Commands::Stop) => stop(&layout).await,
        None => {
            let binary = daemon::daemon_binary_path()?;
            daemon::dry_run(&binary, cli.home.as_deref()).await?;
            info!("Dry run {}", "succeeded".green());
            Ok(())
        }
    }
}
