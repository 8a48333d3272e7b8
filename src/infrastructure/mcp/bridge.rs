//! Request bridging between the gateway and managed processes
//!
//! One `dispatch` call is one JSON-RPC round trip: resolve the server,
//! acquire (or lazily spawn) its process, write the payload, await the
//! correlated response. The configured request timeout covers the whole
//! operation, including any in-flight spawn the caller ends up waiting on.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::domain::models::BridgeConfig;
use crate::infrastructure::mcp::error::{BridgeError, Result};
use crate::infrastructure::mcp::supervisor::Supervisor;

/// The payload of one inbound command.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// An already-structured JSON-RPC object
    Structured(&'a Value),
    /// Raw JSON-RPC text forwarded verbatim
    Raw(&'a str),
}

/// Bridges gateway requests onto supervised processes.
#[derive(Clone)]
pub struct Bridge {
    supervisor: Supervisor,
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge over a supervisor.
    pub fn new(supervisor: Supervisor, config: BridgeConfig) -> Self {
        Self { supervisor, config }
    }

    /// The supervisor backing this bridge.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Round-trip one request against `server`.
    ///
    /// A timeout leaves the process running; only a run of consecutive
    /// timeouts past the configured threshold triggers a restart, and that
    /// restart happens off this request's path.
    pub async fn dispatch(&self, server: &str, payload: Payload<'_>) -> Result<Value> {
        let timeout = self.config.request_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let handle = tokio::time::timeout_at(deadline, self.supervisor.ensure_running(server))
            .await
            .map_err(|_| BridgeError::Timeout(timeout))??;

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let result = match payload {
            Payload::Structured(value) => handle.request(value, remaining).await,
            Payload::Raw(text) => handle.request_raw(text, remaining).await,
        };

        if matches!(&result, Err(BridgeError::Timeout(_))) {
            let strikes = handle.consecutive_timeouts();
            if strikes >= self.config.max_consecutive_timeouts {
                warn!(
                    server,
                    strikes, "consecutive timeout threshold reached; restarting server"
                );
                let supervisor = self.supervisor.clone();
                let name = server.to_string();
                tokio::spawn(async move {
                    if let Err(err) = supervisor.restart(&name).await {
                        warn!(server = %name, error = %err, "restart after timeouts failed");
                    }
                });
            }
        }

        result
    }

    /// The configured per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }
}
