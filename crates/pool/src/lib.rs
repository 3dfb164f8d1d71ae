//! Connection pool and recovery for MCP tool servers.
//!
//! [`ConnectionManager`] keeps at most one live [`Connection`] per
//! configured server and routes every call through that server's
//! [`CircuitBreaker`] and a [`RetryStrategy`]. A [`HealthMonitor`] probes
//! degraded and idle connections in the background.
//!
//! # Example
//!
//! ```no_run
//! use pool::{CallOptions, ConnectionManager, PoolConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> pool::Result<()> {
//! let config = PoolConfig::load("toolpool.toml")?;
//! let manager = ConnectionManager::new(config)?;
//! manager.start_health_monitor();
//!
//! let options = CallOptions::new().deadline(Duration::from_secs(10));
//! let result = manager
//!     .call_tool("filesystem", "read_file", Some(serde_json::json!({"path": "README.md"})), &options)
//!     .await?;
//! for block in &result.content {
//!     if let Some(text) = block.as_text() {
//!         println!("{text}");
//!     }
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod breaker;
mod config;
mod connection;
mod error;
mod health;
mod manager;
mod observer;
mod retry;
mod stats;

#[cfg(test)]
mod testing;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, Permit, Transition};
pub use config::PoolConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{AttemptOutcome, Error, ErrorKind, Result};
pub use health::{HealthConfig, HealthMonitor};
pub use manager::ConnectionManager;
pub use observer::{Observer, PoolEvent, TracingObserver};
pub use retry::{CallOptions, RetryPolicy, RetryStrategy};
pub use stats::{ConnectionPoolStats, ConnectionStats};
