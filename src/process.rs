//! External command execution with bounded timeouts.
//!
//! Every interaction with the container runtime, the VPN daemon, the
//! version-control tool and the session launcher goes through
//! [`CommandRunner`]. A nonzero exit code is data, not an error: callers
//! inspect [`ToolOutput::exit_code`] and decide for themselves. Errors are
//! reserved for the cases where no exit code exists (spawn failure, deadline
//! exceeded).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{HubError, HubResult};

/// Captured result of a finished external command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit code (-1 when the platform reports none, e.g. on signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-invocation execution options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Hard deadline for the child process.
    pub timeout: Duration,
    /// Working directory for the child, if any.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables merged over the inherited environment.
    pub env: Vec<(String, String)>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Execution seam for external tools, mockable in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], opts: RunOptions) -> HubResult<ToolOutput>;
}

/// Runs commands on the host system via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], opts: RunOptions) -> HubResult<ToolOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = opts.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &opts.env {
            command.env(key, value);
        }

        let timeout_secs = opts.timeout.as_secs();
        let output = tokio::time::timeout(opts.timeout, command.output())
            .await
            .map_err(|_| HubError::Timeout {
                tool: program.to_string(),
                seconds: timeout_secs,
            })?
            .map_err(|e| HubError::tool(program, e.to_string()))?;

        Ok(ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
pub mod testing {
    //! Spy runner for exercising engines without touching real tools.

    use std::sync::Mutex;

    use super::*;

    /// One recorded invocation.
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
        pub opts: RunOptions,
    }

    type Responder = dyn Fn(&str, &[String]) -> HubResult<ToolOutput> + Send + Sync;

    /// [`CommandRunner`] that records every call and answers from a closure.
    pub struct SpyRunner {
        calls: Mutex<Vec<RecordedCall>>,
        responder: Box<Responder>,
    }

    impl SpyRunner {
        pub fn new(
            responder: impl Fn(&str, &[String]) -> HubResult<ToolOutput> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        /// Always exits 0 with empty output.
        pub fn succeeding() -> Self {
            Self::with_output(ToolOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        /// Always answers with the given output.
        pub fn with_output(output: ToolOutput) -> Self {
            Self::new(move |_, _| Ok(output.clone()))
        }

        /// Always reports a deadline timeout.
        pub fn timing_out() -> Self {
            Self::new(|program, _| {
                Err(HubError::Timeout {
                    tool: program.to_string(),
                    seconds: 30,
                })
            })
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for SpyRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            opts: RunOptions,
        ) -> HubResult<ToolOutput> {
            self.calls.lock().unwrap().push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
                opts,
            });
            (self.responder)(program, args)
        }
    }
}
