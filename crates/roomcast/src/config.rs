//! Roomcast configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields are
//! redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default path the transport is mounted on.
pub const DEFAULT_PATH: &str = "/socket.io";

/// Default delay for a client to join a namespace before it is closed.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 45_000;

/// Default window during which a disconnected session can be recovered.
pub const DEFAULT_MAX_DISCONNECTION_DURATION_MS: u64 = 120_000;

/// Default Prometheus listener address.
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:9464";

/// Default server instance ID prefix.
pub const DEFAULT_SERVER_ID_PREFIX: &str = "roomcast";

/// Connection-state recovery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// How long a disconnected session stays redeemable.
    pub max_disconnection_duration: Duration,
    /// Whether a successfully recovered socket bypasses the middleware chain.
    pub skip_middlewares: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_disconnection_duration: Duration::from_millis(
                DEFAULT_MAX_DISCONNECTION_DURATION_MS,
            ),
            skip_middlewares: true,
        }
    }
}

/// Process configuration for the `roomcast` binary.
#[derive(Clone)]
pub struct Config {
    /// Path the transport is mounted on (default: "/socket.io").
    pub path: String,

    /// Delay for a client to join a namespace (default: 45s).
    pub connect_timeout: Duration,

    /// Connection-state recovery, `None` when disabled.
    pub recovery: Option<RecoveryConfig>,

    /// Remove dynamically created namespaces once their last socket leaves.
    pub cleanup_empty_child_namespaces: bool,

    /// Unique identifier for this server instance.
    pub server_id: String,

    /// Redis URL for the shared session store.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: Option<SecretString>,

    /// Prometheus exporter bind address.
    pub metrics_bind_address: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("connect_timeout", &self.connect_timeout)
            .field("recovery", &self.recovery)
            .field(
                "cleanup_empty_child_namespaces",
                &self.cleanup_empty_child_namespaces,
            )
            .field("server_id", &self.server_id)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("metrics_bind_address", &self.metrics_bind_address)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let path = vars
            .get("ROOMCAST_PATH")
            .map(|p| normalize_path(p))
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let connect_timeout = Duration::from_millis(parse_or(
            vars,
            "ROOMCAST_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
        )?);

        let recovery = if parse_or(vars, "ROOMCAST_RECOVERY_ENABLED", false)? {
            Some(RecoveryConfig {
                max_disconnection_duration: Duration::from_millis(parse_or(
                    vars,
                    "ROOMCAST_RECOVERY_MAX_DISCONNECTION_MS",
                    DEFAULT_MAX_DISCONNECTION_DURATION_MS,
                )?),
                skip_middlewares: parse_or(vars, "ROOMCAST_RECOVERY_SKIP_MIDDLEWARES", true)?,
            })
        } else {
            None
        };

        let cleanup_empty_child_namespaces =
            parse_or(vars, "ROOMCAST_CLEANUP_EMPTY_CHILD_NAMESPACES", false)?;

        let redis_url = vars
            .get("ROOMCAST_REDIS_URL")
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.clone()));

        let metrics_bind_address = vars
            .get("ROOMCAST_METRICS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_METRICS_BIND_ADDRESS.to_string());

        // Generate server instance ID
        let server_id = vars.get("ROOMCAST_SERVER_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SERVER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            path,
            connect_timeout,
            recovery,
            cleanup_empty_child_namespaces,
            server_id,
            redis_url,
            metrics_bind_address,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

/// Strip trailing slashes, keeping a lone `/`.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && !path.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
