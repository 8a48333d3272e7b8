//! Domain models

pub mod config;
pub mod process;

pub use config::{
    BridgeConfig, Config, Registry, RuntimeConfig, ServerDefinition, SupervisorConfig,
};
pub use process::{ProcessState, ServerStatus};
