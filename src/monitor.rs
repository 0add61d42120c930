//! Idle auto-shutdown.
//!
//! The hub runs inside an ephemeral host that should disappear when nobody
//! is using it. This monitor polls discovery and, once no session has been
//! observed for longer than the idle timeout, sends SIGTERM to the current
//! process so the host's normal shutdown path takes over.
//!
//! A failed discovery probe and a genuinely empty fleet are indistinguishable
//! here; both advance the idle clock. That is inherited behavior: a daemon
//! outage that outlives the idle window will shut the hub down.

use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::broadcast;

use crate::discovery::DiscoveryEngine;

/// Time between discovery polls.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Idle shutdown configuration.
#[derive(Debug, Clone)]
pub struct IdleMonitorConfig {
    /// Master toggle; when false the loop is never started.
    pub auto_shutdown: bool,
    /// Seconds without observed sessions before the process terminates.
    pub idle_timeout_secs: u64,
}

impl Default for IdleMonitorConfig {
    fn default() -> Self {
        Self {
            auto_shutdown: false,
            idle_timeout_secs: 60,
        }
    }
}

/// Idle-clock state, owned exclusively by the monitor loop.
#[derive(Debug)]
struct IdleState {
    last_active: Instant,
    timeout: Duration,
}

impl IdleState {
    fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            last_active: now,
            timeout,
        }
    }

    /// Record one observation; true means the idle limit has elapsed.
    fn observe(&mut self, sessions_seen: usize, now: Instant) -> bool {
        if sessions_seen > 0 {
            self.last_active = now;
            return false;
        }
        now.duration_since(self.last_active) > self.timeout
    }
}

/// Background monitor that terminates the host process when idle.
pub struct IdleShutdownMonitor {
    discovery: DiscoveryEngine,
    config: IdleMonitorConfig,
}

impl IdleShutdownMonitor {
    pub fn new(discovery: DiscoveryEngine, config: IdleMonitorConfig) -> Self {
        Self { discovery, config }
    }

    /// Poll discovery until shutdown or the idle limit triggers termination.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        info!(
            "Idle monitor started, auto-shutdown after {}s of inactivity",
            timeout.as_secs()
        );

        let mut state = IdleState::new(timeout, Instant::now());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown_rx.recv() => {
                    info!("Idle monitor shutting down");
                    return;
                }
            }

            let snapshot = self.discovery.snapshot().await;
            if state.observe(snapshot.sessions.len(), Instant::now()) {
                warn!(
                    "Inactivity limit ({}s) reached, shutting down",
                    timeout.as_secs()
                );
                terminate_self();
                return;
            }
        }
    }
}

/// Send SIGTERM to our own process so the ordinary shutdown path runs.
fn terminate_self() {
    unsafe {
        libc::kill(std::process::id() as libc::pid_t, libc::SIGTERM);
    }
}
