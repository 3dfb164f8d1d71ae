//! Pool configuration, loaded from `toolpool.toml`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use mcp::ServerConfig;
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::error::{Error, Result};
use crate::health::HealthConfig;
use crate::retry::RetryPolicy;

/// Top-level pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Upper bound on handshakes in flight across all servers.
    pub max_concurrent_connects: usize,

    /// Per-attempt send timeout.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,

    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,

    /// Servers by name.
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connects: 4,
            request_timeout: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            servers: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {e}")))?;
        for (name, server) in &mut config.servers {
            server.name.clone_from(name);
        }
        config.validate()?;
        Ok(config)
    }

    /// Add a server, keyed by its name.
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.insert(server.name.clone(), server);
        self
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Reject unusable values. Nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_connects == 0 {
            return Err(invalid("max_concurrent_connects must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout_ms must be greater than 0"));
        }
        self.breaker.validate()?;
        self.retry.validate()?;
        self.health.validate()?;

        for (key, server) in &self.servers {
            if &server.name != key {
                return Err(invalid(format!(
                    "servers.{key} has mismatched name '{}'",
                    server.name
                )));
            }
            server.validate().map_err(|e| match e {
                mcp::Error::Configuration(msg) => Error::Configuration(msg),
                other => Error::Configuration(other.to_string()),
            })?;
        }
        Ok(())
    }
}

pub(crate) fn invalid(message: impl Into<String>) -> Error {
    Error::Configuration(message.into())
}

/// Serde adapter for durations written as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
