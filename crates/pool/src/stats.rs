//! Read-only pool snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::connection::ConnectionState;

/// One server's entry in a [`ConnectionPoolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub server: String,
    /// Absent while connecting or after the connection was dropped.
    pub connection_id: Option<Uuid>,
    pub state: ConnectionState,
    pub breaker: BreakerState,
    pub consecutive_failures: u32,
    /// Time since the breaker last changed state.
    pub breaker_state_ms: u64,
    /// Cumulative for the server, across reconnects.
    pub requests: u64,
    pub failures: u64,
    /// Sends on the current connection only.
    pub connection_requests: u64,
    pub connection_failures: u64,
    pub idle_ms: Option<u64>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Snapshot of the whole pool, recomputed on every call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionPoolStats {
    pub connecting: usize,
    pub ready: usize,
    pub degraded: usize,
    pub closed: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub connections: Vec<ConnectionStats>,
}

impl ConnectionPoolStats {
    pub fn from_connections(mut connections: Vec<ConnectionStats>) -> Self {
        connections.sort_by(|a, b| a.server.cmp(&b.server));
        let mut stats = Self::default();
        for conn in &connections {
            match conn.state {
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Ready => stats.ready += 1,
                ConnectionState::Degraded => stats.degraded += 1,
                ConnectionState::Closed => stats.closed += 1,
            }
            stats.total_requests += conn.requests;
            stats.total_failures += conn.failures;
        }
        stats.connections = connections;
        stats
    }

    pub fn total(&self) -> usize {
        self.connections.len()
    }

    pub fn get(&self, server: &str) -> Option<&ConnectionStats> {
        self.connections.iter().find(|c| c.server == server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(server: &str, state: ConnectionState, requests: u64, failures: u64) -> ConnectionStats {
        ConnectionStats {
            server: server.into(),
            connection_id: None,
            state,
            breaker: BreakerState::Closed,
            consecutive_failures: 0,
            breaker_state_ms: 0,
            requests,
            failures,
            connection_requests: requests,
            connection_failures: failures,
            idle_ms: None,
            connected_at: None,
            last_error: None,
        }
    }

    #[test]
    fn counts_per_state_and_totals() {
        let stats = ConnectionPoolStats::from_connections(vec![
            entry("search", ConnectionState::Degraded, 10, 6),
            entry("fs", ConnectionState::Ready, 4, 1),
            entry("git", ConnectionState::Connecting, 0, 0),
        ]);
        assert_eq!(stats.total(), 3);
        assert_eq!((stats.connecting, stats.ready, stats.degraded, stats.closed), (1, 1, 1, 0));
        assert_eq!(stats.total_requests, 14);
        assert_eq!(stats.total_failures, 7);
        assert_eq!(stats.connections[0].server, "fs");
        assert_eq!(stats.get("search").map(|c| c.failures), Some(6));
    }

    #[test]
    fn serializes_states_in_snake_case() {
        let stats = ConnectionPoolStats::from_connections(vec![entry(
            "fs",
            ConnectionState::Ready,
            1,
            0,
        )]);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["connections"][0]["state"], "ready");
        assert_eq!(json["connections"][0]["breaker"], "closed");
        assert_eq!(json["ready"], 1);
    }
}
