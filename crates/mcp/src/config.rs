//! Per-server connection configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default bound on the `initialize` handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Transport kind for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned subprocess speaking newline-delimited JSON-RPC on stdio.
    Stdio,
    /// JSON-RPC over HTTP POST.
    Http,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server identifier. Filled from the table key when loaded from a file.
    #[serde(default, skip_serializing)]
    pub name: String,

    pub transport: TransportKind,

    /// Command to run (stdio).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for the command (stdio).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment variables (stdio).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Endpoint (http).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra request headers (http).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

impl ServerConfig {
    /// Create a stdio server config.
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }

    /// Create an HTTP server config.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Check the config is usable for its transport kind.
    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err(Error::Configuration("server name must not be empty".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::Configuration(format!(
                "servers.{name}.handshake_timeout_ms must be greater than 0"
            )));
        }

        match self.transport {
            TransportKind::Stdio => match self.command.as_deref() {
                Some(command) if !command.trim().is_empty() => Ok(()),
                _ => Err(Error::Configuration(format!(
                    "servers.{name}.command is required for stdio transport"
                ))),
            },
            TransportKind::Http => {
                let Some(url) = self.url.as_deref() else {
                    return Err(Error::Configuration(format!(
                        "servers.{name}.url is required for http transport"
                    )));
                };
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    Error::Configuration(format!("servers.{name}.url is invalid: {e}"))
                })?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    scheme => Err(Error::Configuration(format!(
                        "servers.{name}.url has unsupported scheme '{scheme}'"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_requires_command() {
        let mut config = ServerConfig::stdio("fs", "mcp-fs", ["--root", "."]);
        assert!(config.validate().is_ok());
        config.command = Some("  ".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("servers.fs.command"));
    }

    #[test]
    fn http_requires_valid_url() {
        assert!(ServerConfig::http("search", "https://example.com/mcp").validate().is_ok());
        assert!(ServerConfig::http("search", "not a url").validate().is_err());
        assert!(ServerConfig::http("search", "ftp://example.com").validate().is_err());

        let mut missing = ServerConfig::http("search", "https://example.com");
        missing.url = None;
        assert!(missing.validate().is_err());
    }

    #[test]
    fn zero_handshake_timeout_is_rejected() {
        let config = ServerConfig::stdio("fs", "mcp-fs", Vec::<String>::new())
            .handshake_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"transport":"stdio","command":"mcp-fs","args":["/tmp"]}"#)
                .unwrap();
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.handshake_timeout_duration(), DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.args, vec!["/tmp".to_string()]);
    }

    #[test]
    fn misspelled_key_is_rejected() {
        let err = serde_json::from_str::<ServerConfig>(
            r#"{"transport":"stdio","comand":"mcp-fs"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("comand"), "{err}");
    }
}
