//! Node configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional YAML/TOML/JSON
//! file, then `CABLE__*` environment variables (`CABLE__SERVER__MAX_CONNECTIONS`).
//! Command-line flags are applied on top by the binary.

use cable_core::{Backoff, FailurePolicy, NetworkedConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CABLE";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Values are out of range.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// Which pub/sub adapter the node runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// In-process delivery only.
    #[default]
    Inline,
    /// Listener task over a notify backend.
    Networked,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LogSettings {
    /// Level for the cable crates (trace, debug, info, warn, error).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,
    /// `pretty` or `json`.
    #[validate(custom(function = "validate_log_format"))]
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Connection hub settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerSettings {
    /// Heartbeat period in milliseconds.
    #[validate(range(min = 100, max = 3_600_000))]
    pub ping_interval_ms: u64,
    /// Connection limit.
    #[validate(range(min = 1))]
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            ping_interval_ms: defaults.ping_interval.as_millis() as u64,
            max_connections: defaults.max_connections,
        }
    }
}

/// Pub/sub adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdapterSettings {
    /// Adapter to run.
    pub kind: AdapterKind,
    /// Reaction to a lost backend connection (networked only).
    pub failure_policy: FailurePolicy,
    /// Upper bound on one listener wait, in milliseconds.
    #[validate(range(min = 10, max = 60_000))]
    pub wait_timeout_ms: u64,
    /// First reconnect delay in milliseconds.
    #[validate(range(min = 1))]
    pub reconnect_initial_ms: u64,
    /// Largest reconnect delay in milliseconds.
    #[validate(range(min = 1))]
    pub reconnect_max_ms: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            kind: AdapterKind::Inline,
            failure_policy: FailurePolicy::FailFast,
            wait_timeout_ms: 1_000,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Path of the WebSocket endpoint.
    #[validate(custom(function = "validate_mount_path"))]
    pub mount_path: String,
    /// Logging.
    #[validate(nested)]
    pub log: LogSettings,
    /// Connection hub.
    #[validate(nested)]
    pub server: ServerSettings,
    /// Pub/sub adapter.
    #[validate(nested)]
    pub adapter: AdapterSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            mount_path: "/cable".to_string(),
            log: LogSettings::default(),
            server: ServerSettings::default(),
            adapter: AdapterSettings::default(),
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `path` if given, then environment overrides, and
    /// validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Hub settings for [`cable_core::Server`].
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            ping_interval: Duration::from_millis(self.server.ping_interval_ms),
            max_connections: self.server.max_connections,
        }
    }

    /// Listener settings for [`cable_core::NetworkedAdapter`].
    pub fn networked_config(&self) -> NetworkedConfig {
        NetworkedConfig {
            wait_timeout: Duration::from_millis(self.adapter.wait_timeout_ms),
            failure_policy: self.adapter.failure_policy,
            reconnect_backoff: Backoff::new(
                Duration::from_millis(self.adapter.reconnect_initial_ms),
                Duration::from_millis(self.adapter.reconnect_max_ms),
            ),
        }
    }
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(invalid("log_level", format!("unknown log level '{}'", level))),
    }
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format.to_lowercase().as_str() {
        "pretty" | "json" => Ok(()),
        _ => Err(invalid("log_format", format!("unknown log format '{}'", format))),
    }
}

fn validate_mount_path(path: &str) -> Result<(), ValidationError> {
    if path.len() > 1 && path.starts_with('/') && !path.ends_with('/') {
        Ok(())
    } else {
        Err(invalid(
            "mount_path",
            format!("mount path '{}' must start with '/' and not end with one", path),
        ))
    }
}
