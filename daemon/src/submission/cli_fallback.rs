use std::io;
use std::path::Path;
use std::process::Stdio;

use formbridge_core::codec::END_MARKER;
use formbridge_core::errors::{FormError, FormResult};
use formbridge_core::settings::CliFallbackSettings;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{DeliveryPath, Submission, SubmissionOutcome};
use crate::session::{HostResponse, ResponseSource};

/// Message text as the utility expects it: without the `!addon!` header line.
fn strip_addon_header(message: &str) -> String {
    let mut stripped = false;
    message
        .split_inclusive('\n')
        .filter(|line| {
            if stripped {
                return true;
            }
            let trimmed = line.trim_end();
            if trimmed.starts_with('!') && trimmed != END_MARKER {
                stripped = true;
                return false;
            }
            true
        })
        .collect()
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Hand the message to the host's command-line utility.
///
/// The utility signals failure only by creating its sentinel file, so the
/// sentinel is deleted first and checked after the process exits.
pub async fn run(
    settings: &CliFallbackSettings,
    temp_dir: &Path,
    submission: &Submission,
) -> FormResult<SubmissionOutcome> {
    let program = settings.program.clone().ok_or_else(|| {
        FormError::configuration("host requires the CLI fallback utility, but none is configured")
    })?;
    let failure_file = settings
        .resolved_failure_file()
        .unwrap_or_else(|| program.with_file_name("submit-failure.txt"));

    fs::create_dir_all(temp_dir).await?;
    let message_file = temp_dir.join(format!("submit-{}.txt", submission.session));
    fs::write(&message_file, strip_addon_header(&submission.message)).await?;
    remove_if_exists(&failure_file).await.map_err(|e| {
        FormError::internal(format!("Failed to remove stale failure file: {}", e))
            .with_context("failure_file", failure_file.display().to_string())
    })?;

    let mut command = Command::new(&program);
    command
        .arg("-a")
        .arg(&submission.addon_name)
        .arg("-f")
        .arg(&message_file)
        .arg("-s")
        .arg(&submission.subject);
    if submission.urgent {
        command.arg("-u");
    }
    command.stdin(Stdio::null());
    debug!(program = %program.display(), file = %message_file.display(), "Running CLI fallback utility");

    let output = command.output().await.map_err(|e| {
        FormError::configuration(format!("Failed to run CLI fallback utility: {}", e))
            .with_context("program", program.display().to_string())
    })?;

    let mut body = String::from_utf8_lossy(&output.stdout).into_owned();
    body.push_str(&String::from_utf8_lossy(&output.stderr));
    let mut response = HostResponse {
        source: ResponseSource::CliUtility,
        status: output.status.code().map(i64::from),
        headers: Vec::new(),
        body,
    };

    match fs::read_to_string(&failure_file).await {
        Ok(failure) => {
            warn!(session = %submission.session, file = %failure_file.display(), "CLI fallback utility reported failure");
            response.body = failure;
            response.headers.push((
                "message_file".to_string(),
                message_file.display().to_string(),
            ));
            Ok(SubmissionOutcome::Rejected { response })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(session = %submission.session, "CLI fallback utility delivered message");
            if let Err(e) = remove_if_exists(&message_file).await {
                warn!(file = %message_file.display(), error = %e, "Failed to remove submitted message file");
            }
            Ok(SubmissionOutcome::Delivered {
                path: DeliveryPath::CliFallback,
                response,
            })
        }
        Err(e) => Err(FormError::internal(format!("Failed to read failure file: {}", e))
            .with_context("failure_file", failure_file.display().to_string())),
    }
}
