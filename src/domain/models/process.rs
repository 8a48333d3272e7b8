//! Managed process lifecycle model

use serde::Serialize;

/// Lifecycle state of a managed MCP server process.
///
/// Transitions: Starting → Running → (Degraded | Stopped) →
/// (Restarting → Starting | Terminated). Terminated is terminal until an
/// explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawn or readiness handshake in progress
    Starting,
    /// Process alive and answering
    Running,
    /// Process alive but recent requests timed out or failed health checks
    Degraded,
    /// No process; next request spawns one
    Stopped,
    /// Waiting out a restart backoff after an unexpected exit
    Restarting,
    /// Crash-loop ceiling exceeded; requests fail until reset
    Terminated,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
            Self::Restarting => "restarting",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Point-in-time status of one configured server, as reported by the
/// supervisor (and surfaced on the health endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Server name from the registry
    pub name: String,
    /// Current lifecycle state
    pub state: ProcessState,
    /// Consecutive unexpected exits counted toward the crash-loop ceiling
    pub restart_count: u32,
    /// OS process id, when a child is alive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since the current child started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Seconds since the child last answered a request or health ping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_healthy_secs_ago: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&ProcessState::Terminated).unwrap();
        assert_eq!(json, r#""terminated""#);
        assert_eq!(ProcessState::Degraded.to_string(), "degraded");
    }

    #[test]
    fn status_omits_absent_fields() {
        let status = ServerStatus {
            name: "echo".to_string(),
            state: ProcessState::Stopped,
            restart_count: 0,
            pid: None,
            uptime_secs: None,
            last_healthy_secs_ago: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("pid").is_none());
        assert_eq!(json["state"], "stopped");
    }
}
