//! Configuration loading and validation

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
