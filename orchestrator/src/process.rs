//! Host-side subprocess helpers.

use anyhow::{Context, Result};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::info;

/// Run a shell command on the host with inherited stdio, echoing it first.
pub async fn run_host_command(command: &str) -> Result<ExitStatus> {
    info!("{command}");
    Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
        .with_context(|| format!("failed to spawn '{command}'"))
}

/// Run a shell command on the host with all output suppressed. Used for
/// coverage upload so credentials never reach the logs.
pub async fn run_host_command_quiet(command: &str) -> Result<ExitStatus> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to spawn '{command}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn propagates_exit_status() {
        let status = run_host_command("exit 7").await.unwrap();
        assert_eq!(status.code(), Some(7));

        let status = run_host_command_quiet("true").await.unwrap();
        assert!(status.success());
    }
}
