//! mcp-relay - HTTP to MCP stdio bridge
//!
//! mcp-relay exposes Model Context Protocol servers over plain HTTP: it
//! accepts REST requests carrying JSON-RPC commands, supervises one child
//! process per configured MCP server, and multiplexes request/response
//! traffic over each child's standard streams.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): configuration and lifecycle models
//! - **Infrastructure Layer** (`infrastructure`): the working parts —
//!   config loading (`infrastructure::config`), process supervision and
//!   protocol bridging (`infrastructure::mcp`), and the HTTP gateway
//!   (`infrastructure::http`)
//!
//! # Example
//!
//! ```ignore
//! use mcp_relay::infrastructure::config::ConfigLoader;
//! use mcp_relay::infrastructure::http::serve;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let registry = ConfigLoader::load_registry(&config.config_file)?;
//!     serve(config, registry).await
//! }
//! ```

pub mod domain;
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::models::{
    BridgeConfig, Config, ProcessState, Registry, ServerDefinition, ServerStatus, SupervisorConfig,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::http::{router, serve, AppState, AuthSettings};
pub use infrastructure::mcp::{Bridge, BridgeError, HealthMonitor, Payload, Supervisor};
