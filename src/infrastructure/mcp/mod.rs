//! MCP integration: process supervision and stdio protocol bridging

pub mod bridge;
pub mod error;
pub mod framing;
pub mod health;
pub mod supervisor;

pub use bridge::{Bridge, Payload};
pub use error::{BridgeError, Result};
pub use framing::FramedClient;
pub use health::HealthMonitor;
pub use supervisor::{ProcessHandle, Supervisor};
