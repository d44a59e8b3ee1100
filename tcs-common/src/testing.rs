//! Test doubles shared by the crates of the workspace.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::command::{Error, Executor, Output, Result};

/// An [`Executor`] that records every command instead of running it.
///
/// Commands containing one of the configured failure patterns return a non-zero exit error;
/// commands containing a configured output pattern return the scripted stdout.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    /// Patterns and the stderr their failure reports.
    failures: Mutex<Vec<(String, String)>>,
    outputs: Mutex<Vec<(String, String)>>,
    missing: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command containing `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.fail_with(pattern, "scripted failure");
    }

    /// Fail every command containing `pattern`, reporting `stderr`.
    pub fn fail_with(&self, pattern: impl Into<String>, stderr: impl Into<String>) {
        self.failures.lock().push((pattern.into(), stderr.into()));
    }

    /// Stop failing commands containing `pattern`.
    pub fn clear_failure(&self, pattern: &str) {
        self.failures.lock().retain(|(p, _)| p != pattern);
    }

    /// Return `stdout` for every command containing `pattern`. Later registrations win.
    pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.outputs.lock().push((pattern.into(), stdout.into()));
    }

    /// Report `program` as not installed.
    pub fn mark_missing(&self, program: impl Into<String>) {
        self.missing.lock().push(program.into());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Commands containing `pattern`.
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        self.commands.lock().iter().filter(|c| c.contains(pattern)).cloned().collect()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn run(&self, cmd: &str) -> Result<String> {
        if cmd.trim().is_empty() {
            return Err(Error::Empty);
        }

        self.commands.lock().push(cmd.to_string());

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            .map(|(_, stderr)| stderr.clone());

        if let Some(stderr) = failure {
            let output = Output { code: Some(1), stdout: String::new(), stderr };
            return Err(Error::NonZero { command: cmd.to_string(), output });
        }

        let outputs = self.outputs.lock();
        let stdout = outputs
            .iter()
            .rev()
            .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(stdout)
    }

    async fn available(&self, program: &str) -> bool {
        !self.missing.lock().iter().any(|p| p == program)
    }
}
