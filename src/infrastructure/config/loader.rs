use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::{Config, Registry, ServerDefinition};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("auth is enabled but no MCP_AUTH_TOKEN is set; set one or set DISABLE_AUTH=true")]
    MissingAuthToken,

    #[error("Invalid port: 0. Must be a bindable port")]
    InvalidPort,

    #[error("Invalid max_restarts: 0. Must be at least 1")]
    InvalidMaxRestarts,

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid request_timeout_ms: 0. Must be positive")]
    InvalidRequestTimeout,

    #[error("Server name cannot be empty")]
    EmptyServerName,

    #[error("Server '{0}' command cannot be empty")]
    EmptyCommand(String),

    #[error("Server '{server}' runtime min_version cannot be empty")]
    EmptyMinVersion { server: String },
}

/// Configuration loader
///
/// Gateway settings merge programmatic defaults with the environment;
/// the server registry is a separate JSON document (`mcp_servers.config.json`
/// by default). Both are validated after extraction, and a failure here
/// aborts startup.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load gateway configuration from the environment.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. `MCP_`-prefixed environment variables (`__` separates nesting,
    ///    e.g. `MCP_SUPERVISOR__MAX_RESTARTS`)
    /// 3. The bare aliases `DISABLE_AUTH` and `MCP_SERVER_KEY`
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("MCP_").split("__"))
            .merge(
                Env::raw()
                    .filter(|key| {
                        let key = key.as_str();
                        key.eq_ignore_ascii_case("DISABLE_AUTH")
                            || key.eq_ignore_ascii_case("MCP_SERVER_KEY")
                    })
                    .map(|key| {
                        if key.as_str().eq_ignore_ascii_case("DISABLE_AUTH") {
                            "disable_auth".into()
                        } else {
                            "default_server".into()
                        }
                    }),
            )
            .extract()
            .context("Failed to extract configuration from environment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate gateway configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if !config.disable_auth && config.auth_token.is_none() {
            return Err(ConfigError::MissingAuthToken);
        }

        if config.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if config.supervisor.max_restarts == 0 {
            return Err(ConfigError::InvalidMaxRestarts);
        }

        if config.supervisor.initial_backoff_ms >= config.supervisor.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.supervisor.initial_backoff_ms,
                config.supervisor.max_backoff_ms,
            ));
        }

        if config.bridge.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout);
        }

        Ok(())
    }

    /// Load and validate the server registry file.
    pub fn load_registry(path: impl AsRef<Path>) -> Result<Registry> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read server registry {}", path.display()))?;
        let servers: HashMap<String, ServerDefinition> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse server registry {}", path.display()))?;

        Self::validate_registry(&servers)?;
        Ok(Registry::new(servers))
    }

    /// Validate parsed server definitions.
    pub fn validate_registry(
        servers: &HashMap<String, ServerDefinition>,
    ) -> Result<(), ConfigError> {
        for (name, definition) in servers {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyServerName);
            }
            if definition.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(name.clone()));
            }
            if let Some(min) = definition
                .runtime_config
                .as_ref()
                .and_then(|runtime| runtime.min_version.as_deref())
            {
                if min.trim().is_empty() {
                    return Err(ConfigError::EmptyMinVersion {
                        server: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_fails_closed_without_token() {
        // Auth on with no secret cannot start: nothing could ever match.
        let config = Config::default();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingAuthToken)
        ));
    }

    #[test]
    fn config_with_token_is_valid() {
        let config = Config {
            auth_token: Some("s3cret".to_string()),
            ..Config::default()
        };
        ConfigLoader::validate(&config).expect("config with token should be valid");
    }

    #[test]
    fn disabled_auth_without_token_is_valid() {
        let config = Config {
            disable_auth: true,
            ..Config::default()
        };
        ConfigLoader::validate(&config).expect("disabled auth needs no token");
    }

    #[test]
    fn zero_max_restarts_is_rejected() {
        let mut config = Config {
            disable_auth: true,
            ..Config::default()
        };
        config.supervisor.max_restarts = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxRestarts)
        ));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let mut config = Config {
            disable_auth: true,
            ..Config::default()
        };
        config.supervisor.initial_backoff_ms = 60_000;
        config.supervisor.max_backoff_ms = 1_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(60_000, 1_000))
        ));
    }

    #[test]
    fn env_overrides_defaults() {
        temp_env::with_vars(
            [
                ("MCP_PORT", Some("9999")),
                ("MCP_HOST", Some("127.0.0.1")),
                ("MCP_AUTH_TOKEN", Some("hunter2")),
                ("MCP_SUPERVISOR__MAX_RESTARTS", Some("7")),
            ],
            || {
                let config = ConfigLoader::load().expect("load should succeed");
                assert_eq!(config.port, 9999);
                assert_eq!(config.host, "127.0.0.1");
                assert_eq!(config.auth_token.as_deref(), Some("hunter2"));
                assert_eq!(config.supervisor.max_restarts, 7);
            },
        );
    }

    #[test]
    fn disable_auth_alias_is_recognized() {
        temp_env::with_vars([("DISABLE_AUTH", Some("true"))], || {
            let config = ConfigLoader::load().expect("load should succeed");
            assert!(config.disable_auth);
        });
    }

    #[test]
    fn server_key_alias_selects_default_server() {
        temp_env::with_vars(
            [
                ("MCP_SERVER_KEY", Some("brave-search")),
                ("DISABLE_AUTH", Some("true")),
            ],
            || {
                let config = ConfigLoader::load().expect("load should succeed");
                assert_eq!(config.default_server.as_deref(), Some("brave-search"));
            },
        );
    }

    #[test]
    fn registry_parses_and_validates() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "brave-search": {{
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-brave-search"],
                    "env": {{"BRAVE_API_KEY": "key"}}
                }},
                "local-tools": {{
                    "command": "python3",
                    "args": ["server.py"],
                    "repository": "https://example.com/tools.git",
                    "build_command": "pip install -r requirements.txt"
                }}
            }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let registry = ConfigLoader::load_registry(file.path()).expect("registry should load");
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("brave-search"));
        assert_eq!(
            registry.get("local-tools").unwrap().build_command.as_deref(),
            Some("pip install -r requirements.txt")
        );
    }

    #[test]
    fn registry_rejects_empty_command() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"broken": {{"command": ""}}}}"#).unwrap();
        file.flush().unwrap();

        let err = ConfigLoader::load_registry(file.path()).unwrap_err();
        assert!(err.to_string().contains("command cannot be empty"));
    }

    #[test]
    fn registry_read_failure_is_fatal() {
        let err = ConfigLoader::load_registry("/nonexistent/mcp_servers.config.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
