//! MCP (Model Context Protocol) connection layer.
//!
//! This crate opens and drives single connections to MCP servers over
//! stdio or HTTP. It knows nothing about pooling or recovery; those live in
//! the `pool` crate, which consumes the [`Connector`] and [`Transport`]
//! traits and the [`Error`] classification defined here.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Connector, McpConnector, Request, ServerConfig, Transport};
//! use std::time::Duration;
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig::stdio("filesystem", "mcp-filesystem", ["--root", "./workspace"]);
//!
//! let transport = McpConnector.open(&config, config.handshake_timeout_duration()).await?;
//! let tools = transport
//!     .send(&Request::list_tools(), Duration::from_secs(10))
//!     .await?;
//! println!("{tools}");
//!
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod http;
mod protocol;
mod stdio;
mod transport;

pub use config::{DEFAULT_HANDSHAKE_TIMEOUT, ServerConfig, TransportKind};
pub use error::{Error, ErrorKind, Phase, Result};
pub use http::{HttpTransport, SESSION_HEADER};
pub use protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    PROTOCOL_VERSION, Request, RequestId, ServerInfo, Tool, ToolContent,
};
pub use stdio::{MAX_OUTPUT_SIZE, StdioTransport};
pub use transport::{CLIENT_NAME, Connector, McpConnector, McpTransport, Transport};
