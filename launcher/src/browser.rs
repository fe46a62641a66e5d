use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", ""]).arg(url);
    command
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> Command {
    let mut command = Command::new("open");
    command.arg(url);
    command
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn browser_command(url: &str) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(url);
    command
}

/// Hand `url` to the desktop's default browser.
pub fn open_url(url: &str) -> Result<()> {
    let mut command = browser_command(url);
    debug!("Opening {} with {:?}", url, command.get_program());
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to open browser for {}", url))?;
    Ok(())
}
