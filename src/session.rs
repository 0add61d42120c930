//! Session lifecycle control.
//!
//! Stopping is the only mutation this module performs, and it is guarded by
//! the fleet identity prefix: an id that does not belong to the naming
//! scheme is rejected before the container runtime is ever invoked, so the
//! dashboard can never stop host containers.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;

use crate::error::{HubError, HubResult};
use crate::hostname::SESSION_PREFIX;
use crate::process::{CommandRunner, RunOptions};

/// Deadline for the runtime's stop primitive.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a stop request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StopOutcome {
    Success {
        session_id: String,
    },
    Error {
        error: String,
        returncode: i32,
    },
}

/// Stops sessions through the container runtime.
#[derive(Clone)]
pub struct SessionController {
    runner: Arc<dyn CommandRunner>,
    container_bin: String,
}

impl SessionController {
    pub fn new(runner: Arc<dyn CommandRunner>, container_bin: impl Into<String>) -> Self {
        Self {
            runner,
            container_bin: container_bin.into(),
        }
    }

    /// Stop a running session by identity.
    ///
    /// Ids outside the `gem-` naming scheme are an authorization failure and
    /// never reach the runtime. Runtime failures and timeouts normalize to an
    /// error outcome rather than propagating.
    pub async fn stop(&self, session_id: &str) -> HubResult<StopOutcome> {
        if !session_id.starts_with(SESSION_PREFIX) {
            return Err(HubError::Forbidden(format!(
                "invalid session id: {} (only {}* sessions can be stopped)",
                session_id, SESSION_PREFIX
            )));
        }

        info!("Stopping session: {}", session_id);

        let args = vec!["stop".to_string(), session_id.to_string()];
        match self
            .runner
            .run(
                &self.container_bin,
                &args,
                RunOptions::with_timeout(STOP_TIMEOUT),
            )
            .await
        {
            Ok(output) if output.success() => Ok(StopOutcome::Success {
                session_id: session_id.to_string(),
            }),
            Ok(output) => {
                let stderr = output.stderr.trim();
                let error = if stderr.is_empty() {
                    format!("failed to stop session {}", session_id)
                } else {
                    stderr.to_string()
                };
                Ok(StopOutcome::Error {
                    error,
                    returncode: output.exit_code,
                })
            }
            Err(e) => Ok(StopOutcome::Error {
                error: e.to_string(),
                returncode: -1,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::SpyRunner;
    use crate::process::ToolOutput;

    #[tokio::test]
    async fn test_stop_rejects_foreign_id_before_exec() {
        let runner = Arc::new(SpyRunner::succeeding());
        let controller = SessionController::new(runner.clone(), "docker");

        let err = controller.stop("not-gem-id").await.unwrap_err();
        assert!(err.is_forbidden());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_success() {
        let runner = Arc::new(SpyRunner::succeeding());
        let controller = SessionController::new(runner.clone(), "docker");

        let outcome = controller.stop("gem-session-id").await.unwrap();
        assert!(matches!(
            outcome,
            StopOutcome::Success { ref session_id } if session_id == "gem-session-id"
        ));

        let call = &runner.calls()[0];
        assert_eq!(call.program, "docker");
        assert_eq!(call.args, vec!["stop", "gem-session-id"]);
    }

    #[tokio::test]
    async fn test_stop_nonzero_exit_becomes_error_outcome() {
        let runner = Arc::new(SpyRunner::with_output(ToolOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error message".to_string(),
        }));
        let controller = SessionController::new(runner, "docker");

        match controller.stop("gem-session-id").await.unwrap() {
            StopOutcome::Error { error, returncode } => {
                assert!(error.contains("error message"));
                assert_eq!(returncode, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_timeout_normalizes_to_error_outcome() {
        let runner = Arc::new(SpyRunner::timing_out());
        let controller = SessionController::new(runner, "docker");

        match controller.stop("gem-session-id").await.unwrap() {
            StopOutcome::Error { error, returncode } => {
                assert!(error.contains("timed out"));
                assert_eq!(returncode, -1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
