use crate::error::ProbeError;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Runs `program` to completion, killing it once `limit` has passed.
pub async fn run_command(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<CommandOutput, ProbeError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| spawn_failure(program, err))?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => output.map_err(|err| ProbeError::Failed(format!("{program}: {err}")))?,
        Err(_) => {
            debug!(event = "command_timeout", program, args = ?args);
            return Err(ProbeError::Timeout(format!(
                "{program} timed out after {}ms",
                limit.as_millis()
            )));
        }
    };
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

/// Like [`run_command`], but a non-zero exit becomes an error carrying the
/// first stderr line.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<String, ProbeError> {
    let output = run_command(program, args, limit).await?;
    if output.success {
        return Ok(output.stdout);
    }
    let reason = output
        .stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("command failed");
    Err(ProbeError::Failed(format!("{program}: {reason}")))
}

fn spawn_failure(program: &str, err: io::Error) -> ProbeError {
    match err.kind() {
        io::ErrorKind::NotFound => ProbeError::ToolMissing(format!("{program} not installed")),
        _ => ProbeError::Failed(format!("{program}: {err}")),
    }
}
