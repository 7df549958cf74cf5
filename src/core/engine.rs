//! External engine client: runs one command descriptor under a bounded retry policy.

use crate::core::command::{CommandDescriptor, FailureClass};
use crate::io::config::RetryConfig;
use crate::types::{SarError, SarResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Fixed-delay retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
        }
    }
}

/// Executes a single attempt of a command and reports its return code
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandDescriptor, attempt: u32) -> SarResult<i32>;
}

/// Runs commands as child processes, appending their output to the command's log file
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &CommandDescriptor, attempt: u32) -> SarResult<i32> {
        if let Some(dir) = command.log_file.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&command.log_file)?;
        writeln!(log, "=== attempt {}: {} ===", attempt, command)?;

        let stdout = log.try_clone()?;
        let stderr = log.try_clone()?;

        log::debug!("Executing {}", command);
        let status = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()?;

        // Killed by a signal: no code
        Ok(status.code().unwrap_or(-1))
    }
}

/// Client for the external engine and the raster collaborators
#[derive(Clone)]
pub struct EngineClient {
    runner: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient").field("policy", &self.policy).finish()
    }
}

impl EngineClient {
    pub fn new(runner: Arc<dyn CommandRunner>, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    /// Client spawning real processes
    pub fn with_processes(policy: RetryPolicy) -> Self {
        Self::new(Arc::new(ProcessRunner), policy)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `command` until it returns 0 or the attempt budget is spent.
    ///
    /// Returns `Ok(0)` on success. On exhaustion a critical command fails with
    /// [`SarError::EngineFailure`], while a best-effort command logs the failure and
    /// returns the last non-zero code.
    pub fn invoke(&self, command: &CommandDescriptor) -> SarResult<i32> {
        command.validate()?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_code = -1;

        for attempt in 1..=max_attempts {
            log::debug!("{} attempt {} of {}", command.label, attempt, max_attempts);

            last_code = match self.runner.run(command, attempt) {
                Ok(code) => code,
                Err(e) => {
                    log::warn!("{} could not be started: {}", command.label, e);
                    -1
                }
            };

            if last_code == 0 {
                return Ok(0);
            }

            if attempt < max_attempts {
                log::warn!(
                    "{} failed with code {} (attempt {} of {}), retrying...",
                    command.label,
                    last_code,
                    attempt,
                    max_attempts
                );
                std::thread::sleep(self.policy.delay);
            }
        }

        match command.class {
            FailureClass::Critical => Err(SarError::EngineFailure {
                operation: command.label.clone(),
                code: last_code,
                attempts: max_attempts,
                log: command.log_file.clone(),
            }),
            FailureClass::BestEffort => {
                log::error!(
                    "{} exited with code {}. See {} for engine output.",
                    command.label,
                    last_code,
                    command.log_file.display()
                );
                Ok(last_code)
            }
        }
    }
}
