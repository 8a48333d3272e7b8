//! Gateway wire types
//!
//! Request/response shapes for the HTTP surface, plus the single mapping
//! from internal error kinds to HTTP statuses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::models::ServerStatus;
use crate::infrastructure::mcp::BridgeError;

/// Query parameters accepted by the API endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiQuery {
    /// Target server name, overriding the configured default
    pub server: Option<String>,
}

/// The `{"command": ..., "server": ...}` envelope variant of the API body
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    /// Raw JSON-RPC text, forwarded verbatim
    pub command: String,
    /// Target server name
    #[serde(default)]
    pub server: Option<String>,
}

/// Health endpoint response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always "ok" when the gateway can answer at all
    pub status: &'static str,
    /// Informational per-server states; not a liveness claim
    pub servers: Vec<ServerStatus>,
}

/// A gateway-level failure rendered as an error envelope.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status the error maps to
    pub status: StatusCode,
    /// Stable machine-readable kind
    pub kind: &'static str,
    /// Human-readable description
    pub message: String,
    /// Captured child stderr, when a spawn failure has any
    pub stderr_tail: Option<String>,
}

impl ApiError {
    /// 400 with the `invalid_request` kind.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
            stderr_tail: None,
        }
    }

    /// 401 with the `unauthorized` kind.
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            message: "missing or invalid bearer token".to_string(),
            stderr_tail: None,
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let message = err.to_string();
        let (status, kind, stderr_tail) = match err {
            BridgeError::UnknownServer(_) => (StatusCode::NOT_FOUND, "unknown_server", None),
            BridgeError::Spawn { stderr_tail, .. } => {
                let tail = if stderr_tail.is_empty() {
                    None
                } else {
                    Some(stderr_tail)
                };
                (StatusCode::BAD_GATEWAY, "spawn_failed", tail)
            }
            BridgeError::CrashLoop { .. } => (StatusCode::SERVICE_UNAVAILABLE, "crash_loop", None),
            BridgeError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request", None),
            BridgeError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout", None),
            BridgeError::ChannelClosed(_) | BridgeError::Io(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_closed", None)
            }
            BridgeError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down", None),
        };
        Self {
            status,
            kind,
            message,
            stderr_tail,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "kind": self.kind,
            "message": self.message,
        });
        if let Some(tail) = self.stderr_tail {
            error["data"] = json!({ "stderr": tail });
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bridge_errors_map_to_documented_statuses() {
        let cases = [
            (
                BridgeError::UnknownServer("x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                BridgeError::spawn("x", "no such file"),
                StatusCode::BAD_GATEWAY,
            ),
            (
                BridgeError::CrashLoop {
                    name: "x".into(),
                    reason: "5 exits".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BridgeError::InvalidRequest("no id".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BridgeError::Timeout(Duration::from_secs(30)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn spawn_error_carries_stderr_tail() {
        let err = BridgeError::Spawn {
            name: "x".into(),
            reason: "exit 1".into(),
            stderr_tail: "ModuleNotFoundError: mcp".into(),
        };
        let api: ApiError = err.into();
        assert_eq!(api.stderr_tail.as_deref(), Some("ModuleNotFoundError: mcp"));
    }

    #[test]
    fn envelope_parses_with_optional_server() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"command": "{\"id\":1}", "server": "brave-search"}"#).unwrap();
        assert_eq!(envelope.server.as_deref(), Some("brave-search"));

        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"command": "{\"id\":1}"}"#).unwrap();
        assert!(envelope.server.is_none());
    }
}
