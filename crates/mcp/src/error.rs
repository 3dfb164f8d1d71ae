//! Connection-layer error types.
//!
//! Every transport reports failures with these kinds and nothing
//! transport-specific leaks past them. The pool classifies them once
//! (see [`Error::is_retryable`]) and attaches them as the cause of its own
//! recovery-layer errors.

use std::fmt;
use std::time::Duration;

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// Which step of a connection's life an operation belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Request,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Handshake => f.write_str("handshake"),
            Phase::Request => f.write_str("request"),
        }
    }
}

/// Stable tag for each connection-layer error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailure,
    ConnectionTimeout,
    ConnectionLost,
    Transport,
    StdioProcess,
    HttpTransport,
    Configuration,
    Rejected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "connection_failure",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::Transport => "transport",
            ErrorKind::StdioProcess => "stdio_process",
            ErrorKind::HttpTransport => "http_transport",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection-layer errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The handshake with the server failed.
    #[error("failed to connect to {server}: {message}")]
    ConnectionFailure { server: String, message: String },

    /// A handshake or a request exceeded its deadline.
    #[error("{server}: {phase} timed out after {}ms", .after.as_millis())]
    ConnectionTimeout {
        server: String,
        phase: Phase,
        after: Duration,
    },

    /// A live transport died mid-use (closed pipe, reset, expired session).
    #[error("connection to {server} lost: {message}")]
    ConnectionLost { server: String, message: String },

    /// Transport failure not otherwise classified.
    #[error("transport error on {server}: {message}")]
    Transport { server: String, message: String },

    /// The server subprocess exited or misbehaved.
    #[error("server process {server} failed: {message}")]
    StdioProcess {
        server: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// HTTP-specific failure, with the response status when there was one.
    #[error("http error on {server}{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    HttpTransport {
        server: String,
        status: Option<u16>,
        message: String,
    },

    /// Invalid setup. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server answered with a JSON-RPC error. Never retried.
    #[error("{server} rejected the request: {error}")]
    Rejected { server: String, error: JsonRpcError },
}

impl Error {
    pub fn failure(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn timeout(server: impl Into<String>, phase: Phase, after: Duration) -> Self {
        Self::ConnectionTimeout {
            server: server.into(),
            phase,
            after,
        }
    }

    pub fn lost(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectionFailure { .. } => ErrorKind::ConnectionFailure,
            Error::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::StdioProcess { .. } => ErrorKind::StdioProcess,
            Error::HttpTransport { .. } => ErrorKind::HttpTransport,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Rejected { .. } => ErrorKind::Rejected,
        }
    }

    /// The server the error concerns, if known.
    pub fn server(&self) -> Option<&str> {
        match self {
            Error::ConnectionFailure { server, .. }
            | Error::ConnectionTimeout { server, .. }
            | Error::ConnectionLost { server, .. }
            | Error::Transport { server, .. }
            | Error::StdioProcess { server, .. }
            | Error::HttpTransport { server, .. }
            | Error::Rejected { server, .. } => Some(server),
            Error::Configuration(_) => None,
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Timeouts, lost connections and transient transport failures are
    /// retryable. Configuration errors, failed handshakes, JSON-RPC
    /// rejections and client-side HTTP errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionTimeout { .. }
            | Error::ConnectionLost { .. }
            | Error::Transport { .. }
            | Error::StdioProcess { .. } => true,
            Error::HttpTransport { status, .. } => match status {
                None => true,
                Some(408 | 429) => true,
                Some(code) => *code >= 500,
            },
            Error::ConnectionFailure { .. } | Error::Configuration(_) | Error::Rejected { .. } => {
                false
            }
        }
    }

    /// Whether the peer answered at all.
    ///
    /// A rejection is a protocol-level answer from a live server, so it does
    /// not count against the server's health.
    pub fn is_peer_failure(&self) -> bool {
        !matches!(self, Error::Rejected { .. } | Error::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: Option<u16>) -> Error {
        Error::HttpTransport {
            server: "search".into(),
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(Error::timeout("fs", Phase::Request, Duration::from_secs(1)).is_retryable());
        assert!(Error::lost("fs", "eof").is_retryable());
        assert!(Error::transport("fs", "reset").is_retryable());
        assert!(http(None).is_retryable());
        assert!(http(Some(503)).is_retryable());
        assert!(http(Some(429)).is_retryable());
    }

    #[test]
    fn permanent_kinds_are_not_retryable() {
        assert!(!Error::Configuration("bad".into()).is_retryable());
        assert!(!Error::failure("fs", "no such command").is_retryable());
        assert!(!http(Some(401)).is_retryable());
        let rejected = Error::Rejected {
            server: "fs".into(),
            error: JsonRpcError {
                code: -32601,
                message: "method not found".into(),
                data: None,
            },
        };
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_peer_failure());
    }

    #[test]
    fn display_includes_server_and_status() {
        assert_eq!(
            http(Some(502)).to_string(),
            "http error on search (status 502): boom"
        );
        assert_eq!(
            Error::timeout("fs", Phase::Handshake, Duration::from_millis(250)).to_string(),
            "fs: handshake timed out after 250ms"
        );
    }

    #[test]
    fn kind_and_server_accessors() {
        let err = Error::lost("fs", "eof");
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert_eq!(err.kind().as_str(), "connection_lost");
        assert_eq!(err.server(), Some("fs"));
        assert_eq!(Error::Configuration("x".into()).server(), None);
    }
}
