use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while supervising servers or bridging requests.
///
/// Cloneable so one spawn attempt's outcome can be handed to every caller
/// waiting on it; I/O causes are therefore carried as rendered strings.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("failed to start server '{name}': {reason}")]
    Spawn {
        name: String,
        reason: String,
        /// Tail of the child's stderr, when any was captured
        stderr_tail: String,
    },

    #[error("server '{name}' is crash-looping ({reason}); reset required")]
    CrashLoop { name: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server '{0}' closed its output stream")]
    ChannelClosed(String),

    #[error("i/o error talking to server: {0}")]
    Io(String),

    #[error("shutting down")]
    ShuttingDown,
}

impl BridgeError {
    /// Spawn failure without captured stderr.
    pub fn spawn(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            name: name.into(),
            reason: reason.into(),
            stderr_tail: String::new(),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for supervisor and bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
