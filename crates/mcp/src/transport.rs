//! Transport abstraction.
//!
//! A [`Connector`] opens a [`Transport`] for a server; the transport then
//! carries single requests until it is closed. Implementations must report
//! failures with the connection-layer [`Error`](crate::Error) kinds.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::config::{ServerConfig, TransportKind};
use crate::error::Result;
use crate::http::HttpTransport;
use crate::protocol::Request;
use crate::stdio::StdioTransport;

/// Name this client reports in the `initialize` handshake.
pub const CLIENT_NAME: &str = "toolpool";

/// An open, handshaken channel to one server.
pub trait Transport: Send + Sync + 'static {
    /// Send one request and wait at most `timeout` for its result.
    fn send(&self, request: &Request, timeout: Duration)
    -> impl Future<Output = Result<Value>> + Send;

    /// Release the underlying resources. Must be idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens transports from server configuration.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Establish the transport and complete the handshake within `timeout`.
    fn open(
        &self,
        config: &ServerConfig,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Transport>> + Send;
}

/// One of the built-in transports, chosen by [`TransportKind`].
pub enum McpTransport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport for McpTransport {
    async fn send(&self, request: &Request, timeout: Duration) -> Result<Value> {
        match self {
            McpTransport::Stdio(t) => t.send(request, timeout).await,
            McpTransport::Http(t) => t.send(request, timeout).await,
        }
    }

    async fn close(&self) {
        match self {
            McpTransport::Stdio(t) => t.close().await,
            McpTransport::Http(t) => t.close().await,
        }
    }
}

/// Connector for the built-in stdio and HTTP transports.
#[derive(Debug, Clone, Default)]
pub struct McpConnector;

impl Connector for McpConnector {
    type Transport = McpTransport;

    async fn open(&self, config: &ServerConfig, timeout: Duration) -> Result<McpTransport> {
        config.validate()?;
        match config.transport {
            TransportKind::Stdio => StdioTransport::open(config, timeout)
                .await
                .map(McpTransport::Stdio),
            TransportKind::Http => HttpTransport::open(config, timeout)
                .await
                .map(McpTransport::Http),
        }
    }
}
