//! A pooled connection: one transport to one server.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcp::{Connector, McpTransport, Request, ServerConfig, Transport};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaker::{BreakerState, CircuitBreaker};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake in flight.
    Connecting,
    Ready,
    /// The server's breaker is not closed.
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    last_activity: Instant,
    last_error: Option<mcp::Error>,
}

/// Owns a transport to one server.
///
/// Sends are serialised. [`close`](Connection::close) aborts a send in
/// flight, which then fails with a connection-lost error.
pub struct Connection<T: Transport = McpTransport> {
    id: Uuid,
    server: String,
    breaker: Arc<CircuitBreaker>,
    transport: Mutex<Option<Arc<T>>>,
    send_slot: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    status: Mutex<Status>,
    connected_at: DateTime<Utc>,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl<T: Transport> Connection<T> {
    /// Open a transport through `connector` and complete the handshake.
    pub async fn open<C>(
        connector: &C,
        config: &ServerConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> mcp::Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let transport = connector
            .open(config, config.handshake_timeout_duration())
            .await?;
        let connection = Self::new(config.name.clone(), transport, breaker);
        info!(server = %connection.server, id = %connection.id, "connected");
        Ok(connection)
    }

    /// Wrap an already handshaken transport.
    pub fn new(server: impl Into<String>, transport: T, breaker: Arc<CircuitBreaker>) -> Self {
        let now = Instant::now();
        let state = match breaker.state() {
            BreakerState::Closed => ConnectionState::Ready,
            _ => ConnectionState::Degraded,
        };
        Self {
            id: Uuid::new_v4(),
            server: server.into(),
            breaker,
            transport: Mutex::new(Some(Arc::new(transport))),
            send_slot: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
            status: Mutex::new(Status {
                state,
                last_activity: now,
                last_error: None,
            }),
            connected_at: Utc::now(),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn last_error(&self) -> Option<mcp::Error> {
        self.status().last_error.clone()
    }

    /// Time since the last completed send.
    pub fn idle_for(&self) -> Duration {
        self.status().last_activity.elapsed()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Send one request.
    ///
    /// `timeout` covers the wait for the send slot as well as the exchange.
    /// A lost peer closes the connection.
    pub async fn send(&self, request: &Request, timeout: Duration) -> mcp::Result<Value> {
        let Some(transport) = self.transport() else {
            return Err(mcp::Error::lost(&self.server, "connection closed"));
        };
        self.requests.fetch_add(1, Ordering::Relaxed);

        let exchange = async {
            let _slot = self.send_slot.lock().await;
            transport.send(request, timeout).await
        };
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(mcp::Error::lost(&self.server, "connection closed")),
            result = tokio::time::timeout(timeout, exchange) => result.unwrap_or_else(|_| {
                Err(mcp::Error::timeout(&self.server, mcp::Phase::Request, timeout))
            }),
        };

        self.record(&result);
        if let Err(e) = &result {
            debug!(server = %self.server, method = %request.method, error = %e, "send failed");
            if e.kind() == mcp::ErrorKind::ConnectionLost {
                self.close().await;
            }
        }
        result
    }

    /// Liveness probe.
    pub async fn ping(&self, timeout: Duration) -> mcp::Result<()> {
        self.send(&Request::ping(), timeout).await.map(|_| ())
    }

    /// Release the transport. Idempotent.
    pub async fn close(&self) {
        self.closed.cancel();
        let transport = self.transport.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.status().state = ConnectionState::Closed;

        if let Some(transport) = transport {
            transport.close().await;
            info!(server = %self.server, id = %self.id, "connection closed");
        }
    }

    /// Mirror a breaker state into the lifecycle. A closed connection stays
    /// closed.
    pub(crate) fn follow_breaker(&self, breaker: BreakerState) {
        let mut status = self.status();
        status.state = match (status.state, breaker) {
            (ConnectionState::Closed, _) => ConnectionState::Closed,
            (_, BreakerState::Open) => ConnectionState::Degraded,
            (_, BreakerState::Closed) => ConnectionState::Ready,
            (state, BreakerState::HalfOpen) => state,
        };
    }

    fn record(&self, result: &mcp::Result<Value>) {
        let mut status = self.status();
        status.last_activity = Instant::now();
        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            status.last_error = Some(e.clone());
        }
    }

    fn transport(&self) -> Option<Arc<T>> {
        self.transport
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::testing::{Outcome, StubConnector};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn open(stub: &StubConnector) -> Connection<crate::testing::StubTransport> {
        let config = ServerConfig::stdio("fs", "unused", Vec::<String>::new());
        let breaker = Arc::new(CircuitBreaker::new("fs", BreakerConfig::default()));
        Connection::open(stub, &config, breaker).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn send_updates_counters_and_activity() {
        let stub = StubConnector::new();
        let conn = open(&stub).await;
        assert_eq!(conn.state(), ConnectionState::Ready);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(conn.idle_for(), Duration::from_secs(3));

        stub.push(Outcome::Ok(json!({"tools": []})));
        stub.push(Outcome::Err(mcp::Error::transport("fs", "garbled")));
        assert!(conn.send(&Request::list_tools(), TIMEOUT).await.is_ok());
        assert!(conn.send(&Request::list_tools(), TIMEOUT).await.is_err());

        assert_eq!(conn.requests(), 2);
        assert_eq!(conn.failures(), 1);
        assert_eq!(conn.idle_for(), Duration::ZERO);
        assert!(matches!(conn.last_error(), Some(mcp::Error::Transport { .. })));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_peer_closes_connection() {
        let stub = StubConnector::new();
        let conn = open(&stub).await;

        stub.push(Outcome::Err(mcp::Error::lost("fs", "eof")));
        assert!(conn.ping(TIMEOUT).await.is_err());
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(stub.closes(), 1);

        let err = conn.ping(TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), mcp::ErrorKind::ConnectionLost);
        assert_eq!(stub.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_aborts_in_flight_send() {
        let stub = StubConnector::new();
        let conn = Arc::new(open(&stub).await);
        stub.set_fallback(Outcome::Hang);

        let sender = Arc::clone(&conn);
        let call = tokio::spawn(async move { sender.ping(TIMEOUT).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.close().await;
        conn.close().await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), mcp::ErrorKind::ConnectionLost);
        assert_eq!(stub.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_send_times_out_behind_a_hung_one() {
        let stub = StubConnector::new();
        let conn = Arc::new(open(&stub).await);
        stub.push(Outcome::Hang);

        let hung = Arc::clone(&conn);
        let _first = tokio::spawn(async move { hung.ping(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let err = conn.ping(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), mcp::ErrorKind::ConnectionTimeout);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The queued request never reached the transport.
        assert_eq!(stub.sends(), 1);
        assert!(!conn.is_closed());
        assert_eq!(conn.failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_follows_breaker_until_closed() {
        let stub = StubConnector::new();
        let conn = open(&stub).await;

        conn.follow_breaker(BreakerState::Open);
        assert_eq!(conn.state(), ConnectionState::Degraded);
        conn.follow_breaker(BreakerState::HalfOpen);
        assert_eq!(conn.state(), ConnectionState::Degraded);
        conn.follow_breaker(BreakerState::Closed);
        assert_eq!(conn.state(), ConnectionState::Ready);

        conn.close().await;
        conn.follow_breaker(BreakerState::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
