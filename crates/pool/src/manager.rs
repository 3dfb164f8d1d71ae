//! The connection pool.
//!
//! Locking, outermost first:
//! - the slot map (`std` mutex), held only to look up, insert or remove
//! - a slot's connect lock (`tokio` mutex), held while connecting that server
//! - the connect semaphore, held only for the handshake
//!
//! Sends never hold any of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::join_all;
use mcp::{
    CallToolResult, Connector, ListToolsResult, McpConnector, Request, ServerConfig, Tool,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::breaker::{BreakerConfig, CircuitBreaker, Transition};
use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::observer::{Observer, PoolEvent, TracingObserver};
use crate::retry::{CallOptions, RetryStrategy};
use crate::stats::{ConnectionPoolStats, ConnectionStats};

type Conn<C> = Connection<<C as Connector>::Transport>;

/// Per-server entry: the breaker plus the current connection.
struct Slot<C: Connector> {
    config: ServerConfig,
    breaker: Arc<CircuitBreaker>,
    /// Serialises connects for this server.
    connect: tokio::sync::Mutex<Option<Arc<Conn<C>>>>,
    /// Lock-free view of the connection for stats and health.
    current: Mutex<Option<Arc<Conn<C>>>>,
    connecting: AtomicBool,
    retired: CancellationToken,
    /// Attempts admitted by the breaker, across reconnects.
    requests: AtomicU64,
    failures: AtomicU64,
}

impl<C: Connector> Slot<C> {
    fn new(config: ServerConfig, breaker_config: BreakerConfig) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(config.name.clone(), breaker_config)),
            config,
            connect: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
            connecting: AtomicBool::new(false),
            retired: CancellationToken::new(),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn current(&self) -> Option<Arc<Conn<C>>> {
        lock(&self.current).clone()
    }

    fn stats(&self) -> ConnectionStats {
        let breaker = self.breaker.snapshot();
        let conn = self.current();
        let state = if self.connecting.load(Ordering::Acquire) {
            ConnectionState::Connecting
        } else {
            conn.as_ref()
                .map(|c| c.state())
                .unwrap_or(ConnectionState::Closed)
        };

        ConnectionStats {
            server: self.name().to_string(),
            connection_id: conn.as_ref().map(|c| c.id()),
            state,
            breaker: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            breaker_state_ms: breaker.since_change.as_millis() as u64,
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            connection_requests: conn.as_ref().map_or(0, |c| c.requests()),
            connection_failures: conn.as_ref().map_or(0, |c| c.failures()),
            idle_ms: conn.as_ref().map(|c| c.idle_for().as_millis() as u64),
            connected_at: conn.as_ref().map(|c| c.connected_at()),
            last_error: conn
                .as_ref()
                .and_then(|c| c.last_error())
                .map(|e| e.to_string()),
        }
    }
}

struct Inner<C: Connector> {
    config: PoolConfig,
    connector: C,
    slots: Mutex<HashMap<String, Arc<Slot<C>>>>,
    connect_limit: Semaphore,
    retry: RetryStrategy,
    observer: Arc<dyn Observer>,
}

/// Pool of connections to the configured servers, at most one per server.
pub struct ConnectionManager<C: Connector = McpConnector> {
    inner: Arc<Inner<C>>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager<McpConnector> {
    /// Pool over the built-in stdio and HTTP transports.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_connector(config, McpConnector)
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn with_connector(config: PoolConfig, connector: C) -> Result<Self> {
        Self::with_observer(config, connector, Arc::new(TracingObserver))
    }

    /// Validates `config` before anything is built.
    pub fn with_observer(
        config: PoolConfig,
        connector: C,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            servers = config.servers.len(),
            max_concurrent_connects = config.max_concurrent_connects,
            "connection pool created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                connect_limit: Semaphore::new(config.max_concurrent_connects),
                retry: RetryStrategy::new(config.retry.clone()),
                config,
                connector,
                slots: Mutex::new(HashMap::new()),
                observer,
            }),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start background probing. Returns `false` if health checks are
    /// disabled or the monitor already runs.
    pub fn start_health_monitor(&self) -> bool {
        if !self.inner.config.health.enabled || self.shutdown.is_cancelled() {
            return false;
        }
        let mut monitor = lock(&self.monitor);
        if monitor.is_some() {
            return false;
        }

        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let health = HealthMonitor::new(
            self.inner.config.health.clone(),
            Arc::clone(&self.inner.observer),
        );
        *monitor = Some(health.spawn(self.shutdown.clone(), move || {
            weak.upgrade().map(|inner| inner.live_connections())
        }));
        true
    }

    /// The live connection to `server`, connecting if there is none.
    pub async fn get_connection(
        &self,
        server: &str,
        options: &CallOptions,
    ) -> Result<Arc<Connection<C::Transport>>> {
        let slot = self.inner.slot(server)?;
        let connect = async {
            self.inner
                .connection(&slot)
                .await
                .map_err(|e| self.inner.map_error(&slot, e))
        };
        let cancel = options.cancel.clone().unwrap_or_default();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::RecoveryCancelled {
                server: server.to_string(),
                cause: None,
            }),
            result = bounded(options, connect) => result.unwrap_or_else(|after| {
                Err(Error::RecoveryTimeout {
                    server: server.to_string(),
                    after,
                    cause: None,
                })
            }),
        }
    }

    /// Send `request` through the breaker and the retry policy.
    pub async fn request(
        &self,
        server: &str,
        request: Request,
        options: &CallOptions,
    ) -> Result<Value> {
        let slot = self.inner.slot(server)?;
        let timeout = options.timeout.unwrap_or(self.inner.config.request_timeout);
        let inner = &self.inner;
        let (slot, request) = (&slot, &request);

        let result = inner
            .retry
            .execute(server, options, move |attempt| {
                inner.attempt(slot, request, timeout, attempt)
            })
            .await;

        if let Err(Error::RetryExhausted { attempts, .. }) = &result {
            inner.observer.observe(&PoolEvent::RetryExhausted {
                server: server.to_string(),
                attempts: attempts.len(),
            });
        }
        result
    }

    pub async fn call_tool(
        &self,
        server: &str,
        name: &str,
        arguments: Option<Value>,
        options: &CallOptions,
    ) -> Result<CallToolResult> {
        let value = self
            .request(server, Request::call_tool(name, arguments), options)
            .await?;
        decode(server, "tools/call", value)
    }

    pub async fn list_tools(&self, server: &str, options: &CallOptions) -> Result<Vec<Tool>> {
        let value = self.request(server, Request::list_tools(), options).await?;
        decode::<ListToolsResult>(server, "tools/list", value).map(|r| r.tools)
    }

    pub async fn ping(&self, server: &str, options: &CallOptions) -> Result<()> {
        self.request(server, Request::ping(), options).await.map(|_| ())
    }

    /// Retire `server`'s slot and close its connection. Returns whether
    /// there was anything to disconnect.
    pub async fn disconnect(&self, server: &str) -> bool {
        let slot = lock(&self.inner.slots).remove(server);
        match slot {
            Some(slot) => {
                self.inner.retire(&slot).await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let slots: Vec<_> = lock(&self.inner.slots).drain().map(|(_, s)| s).collect();
        if slots.is_empty() {
            return;
        }
        info!(count = slots.len(), "disconnecting all servers");
        join_all(slots.iter().map(|slot| self.inner.retire(slot))).await;
    }

    /// Force `server`'s breaker closed.
    pub fn reset_breaker(&self, server: &str) -> Result<()> {
        let slot = self.inner.slot(server)?;
        let transition = slot.breaker.reset();
        self.inner.publish(&slot, transition);
        Ok(())
    }

    /// Snapshot of every server the pool has touched.
    pub fn stats(&self) -> ConnectionPoolStats {
        let slots: Vec<_> = lock(&self.inner.slots).values().cloned().collect();
        ConnectionPoolStats::from_connections(slots.iter().map(|s| s.stats()).collect())
    }

    /// Stop the health monitor and disconnect everything.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let monitor = lock(&self.monitor).take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }
        self.disconnect_all().await;
        info!("connection pool shut down");
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<C: Connector> Inner<C> {
    fn slot(&self, server: &str) -> Result<Arc<Slot<C>>> {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(server) {
            return Ok(Arc::clone(slot));
        }
        let config = self
            .config
            .server(server)
            .ok_or_else(|| Error::Configuration(format!("unknown server '{server}'")))?;
        let slot = Arc::new(Slot::new(config.clone(), self.config.breaker.clone()));
        slots.insert(server.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    /// One attempt: breaker admission, connection, send, outcome report.
    async fn attempt(
        &self,
        slot: &Arc<Slot<C>>,
        request: &Request,
        timeout: std::time::Duration,
        attempt: u32,
    ) -> Result<Value> {
        if slot.retired.is_cancelled() {
            return Err(Error::ConnectionLost {
                server: slot.name().to_string(),
            });
        }

        let (permit, transition) = slot.breaker.acquire()?;
        self.publish(slot, transition);
        slot.requests.fetch_add(1, Ordering::Relaxed);

        let conn = match self.connection(slot).await {
            Ok(conn) => conn,
            Err(e) => {
                slot.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_peer_failure() {
                    let transition = permit.failure();
                    self.publish(slot, transition);
                }
                return Err(self.map_error(slot, e));
            }
        };

        debug!(server = %slot.name(), method = %request.method, attempt, "dispatching");
        let result = conn.send(request, timeout).await;
        if result.is_err() {
            slot.failures.fetch_add(1, Ordering::Relaxed);
        }
        let transition = match &result {
            Err(e) if e.is_peer_failure() => permit.failure(),
            _ => permit.success(),
        };
        self.publish(slot, transition);

        result.map_err(|e| self.map_error(slot, e))
    }

    /// Existing live connection, or a new one. At most one connect per
    /// server runs at a time; the rest wait for its result.
    async fn connection(&self, slot: &Arc<Slot<C>>) -> mcp::Result<Arc<Conn<C>>> {
        let server = slot.name();
        let mut guard = tokio::select! {
            biased;
            _ = slot.retired.cancelled() => return Err(mcp::Error::lost(server, "server disconnected")),
            guard = slot.connect.lock() => guard,
        };

        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        if let Some(stale) = guard.take() {
            self.observer.observe(&PoolEvent::Disconnected {
                server: server.to_string(),
                connection_id: stale.id(),
            });
        }

        let connecting = ConnectingFlag::raise(&slot.connecting);
        let opened = tokio::select! {
            biased;
            _ = slot.retired.cancelled() => Err(mcp::Error::lost(server, "disconnected while connecting")),
            opened = async {
                let _permit = self
                    .connect_limit
                    .acquire()
                    .await
                    .map_err(|_| mcp::Error::lost(server, "pool closed"))?;
                debug!(server, "connecting");
                Connection::open(&self.connector, &slot.config, Arc::clone(&slot.breaker)).await
            } => opened,
        };
        drop(connecting);

        let conn = Arc::new(opened?);
        if slot.retired.is_cancelled() {
            conn.close().await;
            return Err(mcp::Error::lost(server, "server disconnected"));
        }

        *guard = Some(Arc::clone(&conn));
        *lock(&slot.current) = Some(Arc::clone(&conn));
        self.observer.observe(&PoolEvent::Connected {
            server: server.to_string(),
            connection_id: conn.id(),
        });
        Ok(conn)
    }

    async fn retire(&self, slot: &Arc<Slot<C>>) {
        slot.retired.cancel();
        let conn = slot.connect.lock().await.take();
        lock(&slot.current).take();

        if let Some(conn) = conn {
            conn.close().await;
            self.observer.observe(&PoolEvent::Disconnected {
                server: slot.name().to_string(),
                connection_id: conn.id(),
            });
        }
    }

    /// Emit a breaker transition and mirror it into the connection.
    fn publish(&self, slot: &Slot<C>, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        if let Some(conn) = slot.current() {
            conn.follow_breaker(transition.to);
        }
        self.observer.observe(&PoolEvent::BreakerTransition {
            server: slot.name().to_string(),
            from: transition.from,
            to: transition.to,
        });
    }

    fn map_error(&self, slot: &Slot<C>, error: mcp::Error) -> Error {
        if slot.retired.is_cancelled() && error.kind() == mcp::ErrorKind::ConnectionLost {
            Error::ConnectionLost {
                server: slot.name().to_string(),
            }
        } else {
            Error::Connection(error)
        }
    }

    fn live_connections(&self) -> Vec<Arc<Conn<C>>> {
        let slots: Vec<_> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter_map(|s| s.current()).collect()
    }
}

/// Marks a slot as connecting until dropped.
struct ConnectingFlag<'a>(&'a AtomicBool);

impl<'a> ConnectingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ConnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run `fut` under the options' deadline, if any. `Err` carries the deadline.
async fn bounded<F: std::future::Future>(
    options: &CallOptions,
    fut: F,
) -> std::result::Result<F::Output, std::time::Duration> {
    match options.deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| deadline),
        None => Ok(fut.await),
    }
}

fn decode<T: DeserializeOwned>(server: &str, method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        Error::Connection(mcp::Error::transport(
            server,
            format!("malformed {method} result: {e}"),
        ))
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
