//! Running external programs under a cancellation token.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{MigrateResult, MigrationError};

/// Captured output of a finished program.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Run `program` with `args` and return its output.
///
/// The child is killed if `cancel` fires first. A program that cannot be
/// started becomes [`MigrationError::Spawn`]; a non-zero exit status becomes
/// [`MigrationError::Command`].
pub async fn run<I, S>(
    program: &str,
    args: I,
    envs: &[(&str, &str)],
    cancel: &CancellationToken,
) -> MigrateResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program, "Running external command");

    let child = command
        .spawn()
        .map_err(|e| MigrationError::spawn(program, e))?;

    let output = tokio::select! {
        output = child.wait_with_output() => {
            output.map_err(|e| MigrationError::command(program, e.to_string()))?
        }
        _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let message = if stderr.trim().is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        return Err(MigrationError::command(program, message));
    }

    Ok(CommandOutput { stdout, stderr })
}
