//! Pool events and the observer they are published to.

use tracing::{info, warn};
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::error::Error;

/// Something worth reporting happened in the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Connected {
        server: String,
        connection_id: Uuid,
    },
    Disconnected {
        server: String,
        connection_id: Uuid,
    },
    BreakerTransition {
        server: String,
        from: BreakerState,
        to: BreakerState,
    },
    /// Carries an [`Error::HealthCheckFailure`].
    HealthCheckFailed { server: String, error: Error },
    RetryExhausted { server: String, attempts: usize },
}

impl PoolEvent {
    pub fn server(&self) -> &str {
        match self {
            PoolEvent::Connected { server, .. }
            | PoolEvent::Disconnected { server, .. }
            | PoolEvent::BreakerTransition { server, .. }
            | PoolEvent::HealthCheckFailed { server, .. }
            | PoolEvent::RetryExhausted { server, .. } => server,
        }
    }
}

/// Receives pool events. Called inline, so implementations must not block.
pub trait Observer: Send + Sync + 'static {
    fn observe(&self, event: &PoolEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Connected {
                server,
                connection_id,
            } => info!(%server, %connection_id, "server connected"),
            PoolEvent::Disconnected {
                server,
                connection_id,
            } => info!(%server, %connection_id, "server disconnected"),
            PoolEvent::BreakerTransition { server, from, to } => {
                if *to == BreakerState::Open {
                    warn!(%server, %from, %to, "breaker transition");
                } else {
                    info!(%server, %from, %to, "breaker transition");
                }
            }
            PoolEvent::HealthCheckFailed { server, error } => {
                warn!(%server, %error, "health check failed")
            }
            PoolEvent::RetryExhausted { server, attempts } => {
                warn!(%server, attempts, "retries exhausted")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::{Observer, PoolEvent};

    /// Keeps every event for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingObserver {
        events: Mutex<Vec<PoolEvent>>,
    }

    impl RecordingObserver {
        pub(crate) fn events(&self) -> Vec<PoolEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Observer for RecordingObserver {
        fn observe(&self, event: &PoolEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
