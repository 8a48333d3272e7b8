//! Configuration model
//!
//! Gateway settings come from the environment (merged over programmatic
//! defaults by the loader); the MCP server registry comes from a JSON file.
//! Both are read once at startup and never mutated afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Path to the MCP server registry file
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,

    /// Server used when a request does not name one
    #[serde(default)]
    pub default_server: Option<String>,

    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared-secret bearer token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Skip bearer-token checks entirely
    #[serde(default)]
    pub disable_auth: bool,

    /// Root directory for cloned/built server sources
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Restart and shutdown policy
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Request round-trip policy
    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_config_file() -> PathBuf {
    PathBuf::from("mcp_servers.config.json")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".mcp-relay")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: default_config_file(),
            default_server: None,
            host: default_host(),
            port: default_port(),
            auth_token: None,
            disable_auth: false,
            workdir: default_workdir(),
            supervisor: SupervisorConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl Config {
    /// Socket address string the gateway binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Restart, readiness, and shutdown policy for managed processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Consecutive exits tolerated before a server is marked Terminated
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// First restart delay; doubles per consecutive exit
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Restart delay ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Uptime after which the consecutive-exit counter resets
    #[serde(default = "default_stable_uptime_secs")]
    pub stable_uptime_secs: u64,

    /// Grace period for the readiness handshake after spawn
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// How long shutdown waits after SIGTERM before force-killing
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

const fn default_max_restarts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_stable_uptime_secs() -> u64 {
    30
}

const fn default_ready_timeout_ms() -> u64 {
    5_000
}

const fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stable_uptime_secs: default_stable_uptime_secs(),
            ready_timeout_ms: default_ready_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SupervisorConfig {
    /// Readiness handshake grace period.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// SIGTERM-to-SIGKILL grace deadline.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Uptime after which a process is considered stable.
    pub fn stable_uptime(&self) -> Duration {
        Duration::from_secs(self.stable_uptime_secs)
    }
}

/// Round-trip policy for bridged requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Overall deadline for one request (write + correlated read)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Consecutive timeouts on one server before it is restarted
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_max_consecutive_timeouts() -> u32 {
    3
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
        }
    }
}

impl BridgeConfig {
    /// Overall per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One named MCP server definition from the registry file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerDefinition {
    /// Command to execute
    pub command: String,

    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variable overrides for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Git repository to clone before first launch
    #[serde(default)]
    pub repository: Option<String>,

    /// Build command run once in the server's working directory
    #[serde(default)]
    pub build_command: Option<String>,

    /// Runtime constraints declared by the server source
    #[serde(default)]
    pub runtime_config: Option<RuntimeConfig>,
}

/// Runtime constraints for a server definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Minimum interpreter/runtime version the server expects
    #[serde(default)]
    pub min_version: Option<String>,
}

/// Immutable name → definition registry built from the config file
#[derive(Debug, Clone, Default)]
pub struct Registry {
    servers: HashMap<String, ServerDefinition>,
}

impl Registry {
    /// Build a registry from parsed definitions.
    pub fn new(servers: HashMap<String, ServerDefinition>) -> Self {
        Self { servers }
    }

    /// Look up a definition by server name.
    pub fn get(&self, name: &str) -> Option<&ServerDefinition> {
        self.servers.get(name)
    }

    /// Whether `name` is configured.
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Configured server names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Number of configured servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
