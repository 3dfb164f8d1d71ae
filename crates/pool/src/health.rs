//! Background liveness probing.
//!
//! Each tick pings, concurrently, every connection that is degraded or has
//! been idle past the inactivity threshold. Results feed the breaker's probe
//! entry point. Failures are published to the observer and never reach
//! callers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use mcp::Transport;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::breaker::BreakerState;
use crate::config::{invalid, millis};
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::observer::{Observer, PoolEvent};

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,

    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,

    /// Ready connections idle this long get probed.
    #[serde(rename = "inactivity_threshold_ms", with = "millis")]
    pub inactivity_threshold: Duration,

    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(invalid("health.interval_ms must be greater than 0"));
        }
        if self.inactivity_threshold.is_zero() {
            return Err(invalid("health.inactivity_threshold_ms must be greater than 0"));
        }
        if self.probe_timeout.is_zero() {
            return Err(invalid("health.probe_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Probes connections and reports what it finds.
pub struct HealthMonitor {
    config: HealthConfig,
    observer: Arc<dyn Observer>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, observer: Arc<dyn Observer>) -> Self {
        Self { config, observer }
    }

    /// Whether `conn` is due for a probe this tick.
    ///
    /// Half-open breakers are left to their probe request; connecting and
    /// closed connections are never probed.
    pub fn is_due<T: Transport>(&self, conn: &Connection<T>) -> bool {
        if conn.breaker().state() == BreakerState::HalfOpen {
            return false;
        }
        match conn.state() {
            ConnectionState::Degraded => true,
            ConnectionState::Ready => conn.idle_for() >= self.config.inactivity_threshold,
            ConnectionState::Connecting | ConnectionState::Closed => false,
        }
    }

    /// Run one round over `connections`. Returns how many were probed.
    pub async fn check<T: Transport>(&self, connections: &[Arc<Connection<T>>]) -> usize {
        let due: Vec<&Arc<Connection<T>>> = connections
            .iter()
            .filter(|conn| self.is_due::<T>(conn))
            .collect();
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), "probing connections");
        join_all(due.iter().map(|conn| self.probe::<T>(conn))).await;
        due.len()
    }

    async fn probe<T: Transport>(&self, conn: &Connection<T>) {
        let result = conn.ping(self.config.probe_timeout).await;
        // A JSON-RPC rejection still proves the peer is alive.
        let alive = match &result {
            Ok(()) => true,
            Err(e) => !e.is_peer_failure(),
        };

        if let Some(transition) = conn.breaker().record_probe(alive) {
            conn.follow_breaker(transition.to);
            self.observer.observe(&PoolEvent::BreakerTransition {
                server: conn.server().to_string(),
                from: transition.from,
                to: transition.to,
            });
        }

        match result {
            Err(cause) if !alive => {
                let error = Error::HealthCheckFailure {
                    server: conn.server().to_string(),
                    cause,
                };
                self.observer.observe(&PoolEvent::HealthCheckFailed {
                    server: conn.server().to_string(),
                    error,
                });
            }
            _ => debug!(server = %conn.server(), "probe ok"),
        }
    }

    /// Run on a fixed interval until `shutdown` fires or `candidates`
    /// returns `None`.
    pub fn spawn<T, F>(self, shutdown: CancellationToken, mut candidates: F) -> JoinHandle<()>
    where
        T: Transport,
        F: FnMut() -> Option<Vec<Arc<Connection<T>>>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                "health monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(connections) = candidates() else {
                    break;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.check(&connections) => {}
                }
            }
            info!("health monitor stopped");
        })
    }
}
