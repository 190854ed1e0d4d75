//! External-command wrapper for resource discovery.

use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to execute {command}: {error}")]
    Execution { command: String, error: String },
    #[error("command {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Run a probe command and return stdout as a string.
///
/// Used for GPU discovery; a missing binary surfaces as `Execution` so
/// callers can treat the resource as simply absent.
pub async fn run_command(cmd: &mut Command, name: &str) -> Result<String, CommandError> {
    let output = cmd.output().await.map_err(|e| CommandError::Execution {
        command: name.to_string(),
        error: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            command: name.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_success() {
        let mut cmd = Command::new("echo");
        cmd.arg("probe");
        let out = run_command(&mut cmd, "echo").await.unwrap();
        assert_eq!(out.trim(), "probe");
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let mut cmd = Command::new("wjm_no_such_probe_binary");
        let result = run_command(&mut cmd, "probe").await;
        assert!(matches!(result, Err(CommandError::Execution { .. })));
    }
}
