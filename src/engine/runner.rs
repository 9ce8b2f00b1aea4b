//! Subprocess runner abstraction for the local media engine.

use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendFuture;
use crate::cancel::cancellable;

use super::EngineError;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("terminated by signal"), |code| code.to_string())
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait MediaRunner: Send + Sync {
    /// Runs `program` with `args`, capturing stdout and stderr. The child is
    /// killed when `cancel` fires.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, CommandOutput, EngineError>;
}

/// Real runner that spawns processes on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl MediaRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, CommandOutput, EngineError> {
        Box::pin(async move {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let output = cancellable(
                cancel,
                async {
                    command.output().await.map_err(|err| EngineError::Spawn {
                        program: program.to_owned(),
                        message: err.to_string(),
                    })
                },
                || EngineError::Cancelled,
            )
            .await?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
