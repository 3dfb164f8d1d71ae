//! Retry with exponential backoff.
//!
//! Delay before attempt `n + 1` is
//! `min(base_delay * multiplier^(n - 1), max_delay)` plus a uniform jitter
//! in `[0, jitter]`. Only retryable errors are retried; every other error
//! ends the call on the attempt that produced it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{invalid, millis};
use crate::error::{AttemptOutcome, Error, Result};

/// Backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,

    pub multiplier: f64,

    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,

    /// Upper bound of the random extra delay.
    #[serde(rename = "jitter_ms", with = "millis")]
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(invalid("retry.base_delay_ms must be greater than 0"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be a finite number >= 1.0"));
        }
        if self.max_delay < self.base_delay {
            return Err(invalid("retry.max_delay_ms must not be less than retry.base_delay_ms"));
        }
        Ok(())
    }

    /// Deterministic part of the wait after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Wait after failed attempt `attempt`, jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.delay_for(attempt) + jitter
    }
}

/// Per-call controls.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overall bound on the call, backoff waits included.
    pub deadline: Option<Duration>,

    /// Cancels the call between or during attempts.
    pub cancel: Option<CancellationToken>,

    /// Per-attempt send timeout; the pool default when unset.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs a fallible operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
}

impl RetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Call `op` with the 1-based attempt number until it succeeds, fails
    /// with a non-retryable error, or the attempts are spent.
    ///
    /// The deadline and cancellation in `options` abort both a running
    /// attempt and a backoff wait.
    pub async fn execute<T, F, Fut>(&self, server: &str, options: &CallOptions, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = options.deadline.map(|d| started + d);
        let cancel = options.cancel.clone().unwrap_or_default();
        let mut attempts: Vec<AttemptOutcome> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(server, &attempts)),
                _ = expired(deadline) => return Err(timed_out(server, options, &attempts)),
                outcome = op(attempt) => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    debug!(server, attempt, kind = %e.kind(), "non-retryable failure");
                    return Err(e);
                }
                Err(e) => e,
            };
            let elapsed = attempt_started.elapsed();

            if attempt >= self.policy.max_attempts {
                warn!(server, attempts = attempt, error = %error, "retries exhausted");
                attempts.push(AttemptOutcome {
                    attempt,
                    error,
                    elapsed,
                    delay: None,
                });
                return Err(Error::RetryExhausted {
                    server: server.to_string(),
                    attempts,
                });
            }

            let delay = self.policy.backoff(attempt);
            debug!(
                server,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );
            attempts.push(AttemptOutcome {
                attempt,
                error,
                elapsed,
                delay: Some(delay),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(server, &attempts)),
                _ = expired(deadline) => return Err(timed_out(server, options, &attempts)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn last_cause(attempts: &[AttemptOutcome]) -> Option<Box<Error>> {
    attempts.last().map(|a| Box::new(a.error.clone()))
}

fn cancelled(server: &str, attempts: &[AttemptOutcome]) -> Error {
    debug!(server, attempts = attempts.len(), "call cancelled");
    Error::RecoveryCancelled {
        server: server.to_string(),
        cause: last_cause(attempts),
    }
}

fn timed_out(server: &str, options: &CallOptions, attempts: &[AttemptOutcome]) -> Error {
    let after = options.deadline.unwrap_or_default();
    warn!(server, deadline_ms = after.as_millis() as u64, "call deadline exceeded");
    Error::RecoveryTimeout {
        server: server.to_string(),
        after,
        cause: last_cause(attempts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
        }
    }

    fn timeout_error() -> Error {
        mcp::Error::timeout("fs", mcp::Phase::Request, Duration::from_millis(10)).into()
    }

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(2),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn delay_schedule_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(500),
            ..policy(10)
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(200), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(50),
            ..policy(3)
        };
        for _ in 0..100 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(policy(0).validate().is_err());
        assert!(RetryPolicy { multiplier: 0.5, ..policy(3) }.validate().is_err());
        assert!(RetryPolicy { multiplier: f64::NAN, ..policy(3) }.validate().is_err());
        assert!(RetryPolicy { max_delay: Duration::from_millis(10), ..policy(3) }
            .validate()
            .is_err());
        assert!(policy(3).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_with_exponential_waits() {
        let strategy = RetryStrategy::new(policy(3));
        let started = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&started);
        let result: Result<()> = strategy
            .execute("fs", &CallOptions::new(), |_| {
                recorded.lock().unwrap().push(Instant::now());
                async { Err(timeout_error()) }
            })
            .await;

        let starts = started.lock().unwrap().clone();
        assert_eq!(starts.len(), 3);
        assert_close(starts[1] - starts[0], Duration::from_millis(100));
        assert_close(starts[2] - starts[1], Duration::from_millis(200));

        let err = result.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { .. }));
        let attempts = err.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].delay, Some(Duration::from_millis(100)));
        assert_eq!(attempts[1].delay, Some(Duration::from_millis(200)));
        assert_eq!(attempts[2].delay, None);
        assert_eq!(attempts[2].attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_after_one_attempt() {
        let strategy = RetryStrategy::new(policy(5));
        let calls = AtomicU32::new(0);

        let result: Result<()> = strategy
            .execute("fs", &CallOptions::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Configuration("bad".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let strategy = RetryStrategy::new(policy(3));
        let result = strategy
            .execute("fs", &CallOptions::new(), |attempt| async move {
                if attempt < 3 { Err(timeout_error()) } else { Ok(attempt) }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let strategy = RetryStrategy::new(policy(3));
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let counter = Arc::clone(&calls);
        let result: Result<()> = strategy
            .execute("fs", &CallOptions::new().cancel(token), |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(timeout_error()) }
            })
            .await;

        match result {
            Err(Error::RecoveryCancelled { cause, .. }) => assert!(cause.is_some()),
            other => panic!("expected cancellation, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_backoff_with_timeout() {
        let strategy = RetryStrategy::new(policy(5));
        let options = CallOptions::new().deadline(Duration::from_millis(250));
        let started = Instant::now();

        let result: Result<()> = strategy
            .execute("fs", &options, |_| async { Err(timeout_error()) })
            .await;

        match result {
            Err(Error::RecoveryTimeout { after, cause, .. }) => {
                assert_eq!(after, Duration::from_millis(250));
                assert!(matches!(cause.as_deref(), Some(Error::Connection(_))));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_close(started.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_a_hung_attempt() {
        let strategy = RetryStrategy::new(policy(3));
        let options = CallOptions::new().deadline(Duration::from_secs(1));

        let result: Result<()> = strategy
            .execute("fs", &options, |_| std::future::pending())
            .await;

        match result {
            Err(Error::RecoveryTimeout { cause, .. }) => assert!(cause.is_none()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
