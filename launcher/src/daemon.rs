use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use which::which;

use crate::discovery::{DaemonSpawner, LaunchError};

pub const DAEMON_BINARY: &str = "formbridge-daemon";

fn binary_file_name() -> String {
    format!("{}{}", DAEMON_BINARY, env::consts::EXE_SUFFIX)
}

/// Locate the daemon executable: next to this binary first, then on PATH,
/// then the usual install locations.
pub fn daemon_binary_path() -> Result<PathBuf> {
    let file_name = binary_file_name();

    if let Some(dir) = env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        let sibling = dir.join(&file_name);
        if sibling.exists() {
            debug!("Found {} next to launcher: {}", DAEMON_BINARY, sibling.display());
            return Ok(sibling);
        }
    }

    if let Ok(path) = which(DAEMON_BINARY) {
        debug!("Found {} in PATH: {}", DAEMON_BINARY, path.display());
        return Ok(path);
    }

    let mut candidates = vec![PathBuf::from("/usr/local/bin").join(&file_name)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin").join(&file_name));
    }
    candidates
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("Could not find the {} binary", DAEMON_BINARY))
}

fn daemon_command(binary: &Path, home: Option<&Path>) -> std::process::Command {
    let mut command = std::process::Command::new(binary);
    if let Some(home) = home {
        command.arg("--home").arg(home);
    }
    command
}

/// Starts detached daemon processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    binary: PathBuf,
    home: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new(binary: PathBuf, home: Option<PathBuf>) -> Self {
        Self { binary, home }
    }
}

impl DaemonSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<(), LaunchError> {
        let child = daemon_command(&self.binary, self.home.as_deref())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{}: {}", self.binary.display(), e)))?;
        debug!(pid = child.id(), "Spawned {}", DAEMON_BINARY);
        Ok(())
    }
}

/// Run the daemon's self-check and wait for it.
pub async fn dry_run(binary: &Path, home: Option<&Path>) -> Result<()> {
    let mut command = tokio::process::Command::from(daemon_command(binary, home));
    let status = command
        .arg("--dry-run")
        .stdin(Stdio::null())
        .status()
        .await
        .with_context(|| format!("Failed to run {}", binary.display()))?;
    if !status.success() {
        return Err(anyhow!("Dry run failed with {}", status));
    }
    Ok(())
}
