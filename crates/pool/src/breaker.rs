//! Per-server circuit breaker.
//!
//! Three states:
//! - Closed: requests flow, consecutive failures are counted
//! - Open: requests fail fast until the open duration has elapsed
//! - HalfOpen: a single probe request decides whether to close again
//!
//! State changes only in response to reported outcomes, elapsed time and
//! an explicit [`CircuitBreaker::reset`]. Every change is handed back to
//! the caller as a [`Transition`] so it can be published.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{invalid, millis};
use crate::error::{Error, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// Consecutive probe successes that close it from half-open.
    pub success_threshold: u32,

    /// How long the breaker stays open before admitting a probe.
    #[serde(rename = "open_duration_ms", with = "millis")]
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(invalid("breaker.success_threshold must be at least 1"));
        }
        if self.open_duration.is_zero() {
            return Err(invalid("breaker.open_duration_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub since_change: Duration,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    probe_successes: u32,
    probe_in_flight: bool,
    opened_at: Instant,
    changed_at: Instant,
}

impl Inner {
    fn enter(&mut self, to: BreakerState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.changed_at = now;
        self.probe_successes = 0;
        self.probe_in_flight = false;
        match to {
            BreakerState::Open => self.opened_at = now,
            BreakerState::Closed => self.consecutive_failures = 0,
            BreakerState::HalfOpen => {}
        }
        Transition { from, to }
    }
}

/// Failure-isolation state machine for one server.
#[derive(Debug)]
pub struct CircuitBreaker {
    server: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(server: impl Into<String>, config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            server: server.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                probe_in_flight: false,
                opened_at: now,
                changed_at: now,
            }),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            since_change: inner.changed_at.elapsed(),
        }
    }

    /// Ask to dispatch a request.
    ///
    /// An open breaker whose open duration has elapsed moves to half-open
    /// and admits the caller as its probe; the transition is returned with
    /// the permit.
    pub fn acquire(&self) -> Result<(Permit<'_>, Option<Transition>)> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => Ok((self.permit(false), None)),
            BreakerState::Open => {
                let elapsed = now.saturating_duration_since(inner.opened_at);
                if elapsed < self.config.open_duration {
                    return Err(self.open_error(self.config.open_duration - elapsed));
                }
                let transition = inner.enter(BreakerState::HalfOpen, now);
                inner.probe_in_flight = true;
                info!(server = %self.server, "circuit half-open, admitting probe");
                Ok((self.permit(true), Some(transition)))
            }
            BreakerState::HalfOpen if inner.probe_in_flight => Err(self.open_error(Duration::ZERO)),
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok((self.permit(true), None))
            }
        }
    }

    /// Feed a health-probe result.
    ///
    /// On an open breaker a success moves it to half-open early and a
    /// failure restarts the open timer. On a closed breaker probes count
    /// like ordinary outcomes. Half-open breakers ignore probes.
    pub fn record_probe(&self, ok: bool) -> Option<Transition> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Open if ok => {
                info!(server = %self.server, "probe succeeded, circuit half-open");
                Some(inner.enter(BreakerState::HalfOpen, now))
            }
            BreakerState::Open => {
                inner.opened_at = now;
                debug!(server = %self.server, "probe failed, open timer restarted");
                None
            }
            BreakerState::Closed => self.settle(&mut inner, ok, false, now),
            BreakerState::HalfOpen => None,
        }
    }

    /// Force the breaker closed with zero failures.
    pub fn reset(&self) -> Option<Transition> {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::Closed {
            return None;
        }
        info!(server = %self.server, "circuit reset");
        Some(inner.enter(BreakerState::Closed, Instant::now()))
    }

    fn settle(&self, inner: &mut Inner, ok: bool, probe: bool, now: Instant) -> Option<Transition> {
        match (inner.state, ok) {
            (BreakerState::Closed, true) => {
                inner.consecutive_failures = 0;
                None
            }
            (BreakerState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures < self.config.failure_threshold {
                    return None;
                }
                warn!(
                    server = %self.server,
                    failures = inner.consecutive_failures,
                    open_ms = self.config.open_duration.as_millis() as u64,
                    "circuit opened"
                );
                Some(inner.enter(BreakerState::Open, now))
            }
            (BreakerState::HalfOpen, true) if probe => {
                inner.probe_in_flight = false;
                inner.probe_successes += 1;
                if inner.probe_successes < self.config.success_threshold {
                    return None;
                }
                info!(server = %self.server, "probe succeeded, circuit closed");
                Some(inner.enter(BreakerState::Closed, now))
            }
            (BreakerState::HalfOpen, false) if probe => {
                inner.consecutive_failures += 1;
                warn!(server = %self.server, "probe failed, circuit reopened");
                Some(inner.enter(BreakerState::Open, now))
            }
            // Outcomes of requests admitted before the breaker opened.
            _ => None,
        }
    }

    fn permit(&self, probe: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            probe,
            reported: false,
        }
    }

    fn open_error(&self, retry_in: Duration) -> Error {
        Error::CircuitBreakerOpen {
            server: self.server.clone(),
            retry_in,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Admission to dispatch one request.
///
/// Consume it with [`Permit::success`] or [`Permit::failure`]. Dropping it
/// unreported hands the half-open probe slot back without a state change.
#[must_use = "report the outcome through the permit"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl Permit<'_> {
    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(self) -> Option<Transition> {
        self.report(true)
    }

    pub fn failure(self) -> Option<Transition> {
        self.report(false)
    }

    fn report(mut self, ok: bool) -> Option<Transition> {
        self.reported = true;
        let mut inner = self.breaker.lock();
        self.breaker
            .settle(&mut inner, ok, self.probe, Instant::now())
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.reported || !self.probe {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }
}
