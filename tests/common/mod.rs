//! Shared helpers for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use mcp_relay::{
    AppState, AuthSettings, Bridge, BridgeConfig, Registry, ServerDefinition, Supervisor,
    SupervisorConfig,
};

/// A definition running a plain command with no build step.
pub fn definition(command: &str, args: &[&str]) -> ServerDefinition {
    ServerDefinition {
        command: command.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        env: HashMap::new(),
        repository: None,
        build_command: None,
        runtime_config: None,
    }
}

/// Registry from (name, command, args) triples.
pub fn registry(entries: &[(&str, &str, &[&str])]) -> Registry {
    let servers = entries
        .iter()
        .map(|(name, command, args)| ((*name).to_string(), definition(command, args)))
        .collect();
    Registry::new(servers)
}

/// Supervisor policy tuned for fast tests: short readiness grace, small
/// backoffs, three-strike crash loop.
pub fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        max_restarts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        stable_uptime_secs: 30,
        ready_timeout_ms: 200,
        shutdown_grace_secs: 2,
    }
}

pub fn fast_bridge_config() -> BridgeConfig {
    BridgeConfig {
        request_timeout_ms: 2_000,
        max_consecutive_timeouts: 10,
    }
}

pub fn supervisor(registry: Registry) -> Supervisor {
    Supervisor::new(registry, fast_supervisor_config(), workdir())
}

pub fn workdir() -> PathBuf {
    std::env::temp_dir().join("mcp-relay-tests")
}

/// Gateway state over a fresh supervisor.
pub fn app_state(registry: Registry, auth: AuthSettings, default_server: Option<&str>) -> AppState {
    let bridge = Bridge::new(supervisor(registry), fast_bridge_config());
    AppState {
        bridge,
        default_server: default_server.map(Into::into),
        auth,
    }
}
