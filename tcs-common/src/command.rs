//! Utilities for running kernel tooling (`ip`, `tc`, `iptables`, ...) as child processes.

use std::{env, io, path::Path, process};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(
        "`{command}` exited with {status}: {stderr}",
        status = .output.status_str(),
        stderr = .output.stderr.trim()
    )]
    NonZero { command: String, output: Output },
}

/// The captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// The exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    fn status_str(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            code: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runs command lines on behalf of the reconcilers and the measurement engine.
///
/// Implementations never retry: callers decide whether a failure skips a record or aborts
/// the whole pass.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Runs the command provided as a string, separating args on whitespace, and returns its
    /// decoded stdout.
    async fn run(&self, cmd: &str) -> Result<String>;

    /// Returns `true` if `program` can be found on this host.
    async fn available(&self, program: &str) -> bool;
}

/// [`Executor`] spawning real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runner;

impl Runner {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for Runner {
    async fn run(&self, cmd: &str) -> Result<String> {
        let mut iter = cmd.split_ascii_whitespace();
        let program = iter.next().ok_or(Error::Empty)?;

        let mut command = tokio::process::Command::new(program);
        command.args(iter).stdout(process::Stdio::piped()).stderr(process::Stdio::piped());

        tracing::debug!(cmd, "running command");

        let output: Output = command.output().await?.into();

        if output.code != Some(0) {
            tracing::debug!(
                stderr = ?output.stderr,
                stdout = ?output.stdout,
                code = ?output.code,
                cmd,
                "command returned non-zero status"
            );
            return Err(Error::NonZero { command: cmd.to_string(), output });
        }

        Ok(output.stdout)
    }

    async fn available(&self, program: &str) -> bool {
        let Some(paths) = env::var_os("PATH") else {
            return false;
        };

        env::split_paths(&paths).any(|dir| Path::new(&dir).join(program).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runner_captures_stdout() {
        let out = Runner.run("echo hello world").await.unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[tokio::test]
    async fn runner_rejects_empty_command() {
        let err = Runner.run("   ").await.unwrap_err();
        assert!(matches!(err, Error::Empty));
    }

    #[tokio::test]
    async fn runner_reports_non_zero_exit() {
        let err = Runner.run("ls /definitely/not/a/real/path").await.unwrap_err();
        match err {
            Error::NonZero { command, output } => {
                assert_eq!(command, "ls /definitely/not/a/real/path");
                assert_ne!(output.code, Some(0));
                assert!(!output.stderr.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runner_finds_programs_on_path() {
        assert!(Runner.available("sh").await);
        assert!(!Runner.available("no-such-binary-tcs").await);
    }
}
