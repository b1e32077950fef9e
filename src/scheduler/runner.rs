//! Shell execution of scheduled commands.

use std::process::Stdio;

use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::error::{FleetError, Result};

/// Runs one scheduled command to completion. Abstracted so the scheduler
/// can be driven by a fake in tests.
#[tonic::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute `cmd`; `spec` is the trigger description, for logging only.
    async fn run(&self, spec: &str, cmd: &str) -> Result<String>;
}

/// Interprets commands through the configured shell (`sh -c` by default).
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

#[tonic::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &str, cmd: &str) -> Result<String> {
        tracing::info!(%spec, %cmd, "running command");
        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            command.current_dir(dir);
        }

        let output = command.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            tracing::debug!(%cmd, bytes = stdout.len(), "command finished");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(%cmd, status = ?output.status.code(), "command failed");
            Err(FleetError::Internal(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let runner = ShellRunner::new(RunnerConfig::default());
        let out = runner.run("test", "echo hello").await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let runner = ShellRunner::new(RunnerConfig::default());
        let err = runner.run("test", "exit 3").await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn respects_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig {
            shell: "sh".to_string(),
            workdir: Some(dir.path().to_string_lossy().into_owned()),
        });
        let out = runner.run("test", "pwd").await.unwrap();
        let got = std::fs::canonicalize(out.trim()).unwrap();
        let want = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(got, want);
    }
}
