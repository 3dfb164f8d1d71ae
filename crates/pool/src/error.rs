//! Recovery-layer error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Stable tag for each recovery-layer error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RetryExhausted,
    CircuitBreakerOpen,
    HealthCheckFailure,
    RecoveryTimeout,
    RecoveryCancelled,
    ConnectionLost,
    Configuration,
    /// A connection-layer error ended the call; see [`Error::connection_error`].
    Connection,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorKind::HealthCheckFailure => "health_check_failure",
            ErrorKind::RecoveryTimeout => "recovery_timeout",
            ErrorKind::RecoveryCancelled => "recovery_cancelled",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt inside a retried call.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: Error,
    /// How long the attempt ran before failing.
    pub elapsed: Duration,
    /// Backoff waited before the next attempt; `None` for the last one.
    pub delay: Option<Duration>,
}

/// Pool errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Every attempt failed with a retryable error.
    #[error("{server}: gave up after {} attempts: {}", .attempts.len(), last_error(.attempts))]
    RetryExhausted {
        server: String,
        attempts: Vec<AttemptOutcome>,
    },

    /// Fast-failed without dispatch.
    #[error("circuit breaker open for {server}, retry in {}ms", .retry_in.as_millis())]
    CircuitBreakerOpen { server: String, retry_in: Duration },

    /// A background probe failed. Reported to the observer, never returned
    /// from a call.
    #[error("health check failed for {server}: {cause}")]
    HealthCheckFailure {
        server: String,
        #[source]
        cause: mcp::Error,
    },

    /// The call's overall deadline passed during an attempt or a backoff wait.
    #[error("{server}: deadline of {}ms exceeded", .after.as_millis())]
    RecoveryTimeout {
        server: String,
        after: Duration,
        #[source]
        cause: Option<Box<Error>>,
    },

    /// The caller cancelled the call.
    #[error("{server}: call cancelled")]
    RecoveryCancelled {
        server: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    /// The server was disconnected while the call was in flight.
    #[error("connection to {server} was closed")]
    ConnectionLost { server: String },

    /// Invalid pool configuration or unknown server.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A connection-layer error that ended the call.
    #[error("connection error: {0}")]
    Connection(#[from] mcp::Error),
}

fn last_error(attempts: &[AttemptOutcome]) -> String {
    attempts
        .last()
        .map(|a| a.error.to_string())
        .unwrap_or_else(|| "no attempts recorded".to_string())
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Error::CircuitBreakerOpen { .. } => ErrorKind::CircuitBreakerOpen,
            Error::HealthCheckFailure { .. } => ErrorKind::HealthCheckFailure,
            Error::RecoveryTimeout { .. } => ErrorKind::RecoveryTimeout,
            Error::RecoveryCancelled { .. } => ErrorKind::RecoveryCancelled,
            Error::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Connection(_) => ErrorKind::Connection,
        }
    }

    /// The server the error concerns, if known.
    pub fn server(&self) -> Option<&str> {
        match self {
            Error::RetryExhausted { server, .. }
            | Error::CircuitBreakerOpen { server, .. }
            | Error::HealthCheckFailure { server, .. }
            | Error::RecoveryTimeout { server, .. }
            | Error::RecoveryCancelled { server, .. }
            | Error::ConnectionLost { server } => Some(server),
            Error::Configuration(_) => None,
            Error::Connection(e) => e.server(),
        }
    }

    /// Only connection-layer errors can be retried; every recovery-layer
    /// outcome is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The connection-layer cause of a [`Error::Connection`].
    pub fn connection_error(&self) -> Option<&mcp::Error> {
        match self {
            Error::Connection(e) => Some(e),
            _ => None,
        }
    }

    /// Attempt history of an exhausted call.
    pub fn attempts(&self) -> &[AttemptOutcome] {
        match self {
            Error::RetryExhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn connection_errors_keep_their_classification() {
        let lost: Error = mcp::Error::lost("fs", "eof").into();
        assert!(lost.is_retryable());
        assert_eq!(lost.kind(), ErrorKind::Connection);
        assert_eq!(lost.kind().as_str(), "connection");
        assert_eq!(
            lost.connection_error().map(|e| e.kind()),
            Some(mcp::ErrorKind::ConnectionLost)
        );
        assert!(lost.source().is_some());
        assert_eq!(lost.server(), Some("fs"));

        let failed: Error = mcp::Error::failure("fs", "bad handshake").into();
        assert!(!failed.is_retryable());
    }

    #[test]
    fn recovery_errors_are_final() {
        let open = Error::CircuitBreakerOpen {
            server: "fs".into(),
            retry_in: Duration::from_millis(1500),
        };
        assert!(!open.is_retryable());
        assert_eq!(open.to_string(), "circuit breaker open for fs, retry in 1500ms");
        assert!(!Error::ConnectionLost { server: "fs".into() }.is_retryable());
    }

    #[test]
    fn exhausted_reports_last_attempt() {
        let attempt = |n, msg: &str| AttemptOutcome {
            attempt: n,
            error: mcp::Error::lost("fs", msg).into(),
            elapsed: Duration::from_millis(5),
            delay: None,
        };
        let err = Error::RetryExhausted {
            server: "fs".into(),
            attempts: vec![attempt(1, "first"), attempt(2, "second")],
        };
        assert_eq!(err.attempts().len(), 2);
        assert!(err.to_string().ends_with("connection to fs lost: second"));
    }

    #[test]
    fn timeout_exposes_cause() {
        let err = Error::RecoveryTimeout {
            server: "fs".into(),
            after: Duration::from_secs(1),
            cause: Some(Box::new(mcp::Error::lost("fs", "eof").into())),
        };
        assert_eq!(err.kind(), ErrorKind::RecoveryTimeout);
        assert!(err.source().is_some());
    }
}
