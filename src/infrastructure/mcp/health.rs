//! Health monitoring for managed MCP servers
//!
//! A background task per server pings it over JSON-RPC at a fixed interval,
//! tracks consecutive failures, and asks the supervisor for a restart once
//! the failure ceiling is reached. Servers that are not currently running
//! are skipped: monitoring never spawns a process on its own.

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infrastructure::mcp::supervisor::Supervisor;

/// Health monitor with auto-restart.
pub struct HealthMonitor {
    supervisor: Supervisor,
    check_interval: Duration,
    max_failures: u32,
    check_timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor with the default cadence: check every 10 seconds,
    /// restart after 3 consecutive failures, 5 second ping timeout.
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            check_interval: Duration::from_secs(10),
            max_failures: 3,
            check_timeout: Duration::from_secs(5),
        }
    }

    /// Create a monitor with a custom cadence.
    pub fn with_config(
        supervisor: Supervisor,
        check_interval: Duration,
        max_failures: u32,
        check_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            check_interval,
            max_failures,
            check_timeout,
        }
    }

    /// Start the monitoring task for one server.
    ///
    /// Runs until a shutdown signal arrives on `shutdown_rx`.
    pub fn start_monitoring(
        &self,
        server_name: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let check_interval = self.check_interval;
        let max_failures = self.max_failures;
        let check_timeout = self.check_timeout;

        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            let mut interval = tokio::time::interval(check_interval);
            // The first tick fires immediately; skip it.
            interval.tick().await;

            info!(
                server = %server_name,
                check_interval_secs = check_interval.as_secs(),
                max_failures,
                "started health monitoring"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match Self::check(&supervisor, &server_name, check_timeout).await {
                            None => {
                                // Not running; nothing to monitor this round.
                                consecutive_failures = 0;
                            }
                            Some(true) => {
                                if consecutive_failures > 0 {
                                    info!(
                                        server = %server_name,
                                        recovered_after = consecutive_failures,
                                        "health check recovered"
                                    );
                                }
                                consecutive_failures = 0;
                            }
                            Some(false) => {
                                consecutive_failures += 1;
                                warn!(
                                    server = %server_name,
                                    consecutive_failures,
                                    max_failures,
                                    "health check failed"
                                );
                                if consecutive_failures >= max_failures {
                                    warn!(server = %server_name, "max health failures reached; restarting");
                                    match supervisor.restart(&server_name).await {
                                        Ok(()) => {
                                            info!(server = %server_name, "restarted after failed health checks");
                                            consecutive_failures = 0;
                                        }
                                        Err(err) => {
                                            warn!(server = %server_name, error = %err, "health-driven restart failed");
                                        }
                                    }
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(server = %server_name, "shutdown signal; stopping health monitoring");
                        break;
                    }
                }
            }

            debug!(server = %server_name, "health monitoring stopped");
        })
    }

    /// Ping a server if it is running. `None` when there is no live process.
    async fn check(supervisor: &Supervisor, server_name: &str, timeout: Duration) -> Option<bool> {
        let handle = supervisor.running_handle(server_name)?;
        let ping = json!({
            "jsonrpc": "2.0",
            "id": format!("health_check_{server_name}_{}", handle.generation()),
            "method": "ping",
            "params": {}
        });
        match handle.request(&ping, timeout).await {
            Ok(_) => Some(true),
            Err(err) => {
                debug!(server = %server_name, error = %err, "health ping failed");
                Some(false)
            }
        }
    }
}
