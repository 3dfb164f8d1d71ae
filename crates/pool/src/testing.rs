//! Scripted connector and transport for pool tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp::{Connector, Request, ServerConfig, Transport};
use serde_json::{Value, json};

/// What the next send returns.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Ok(Value),
    Err(mcp::Error),
    /// Never completes.
    Hang,
}

#[derive(Debug)]
struct Script {
    handshakes: AtomicUsize,
    sends: AtomicUsize,
    closes: AtomicUsize,
    handshake_delay: Mutex<Duration>,
    send_delay: Mutex<Duration>,
    connect_errors: Mutex<VecDeque<mcp::Error>>,
    outcomes: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
}

/// Connector whose transports replay a shared script.
#[derive(Debug, Clone)]
pub(crate) struct StubConnector {
    script: Arc<Script>,
}

impl StubConnector {
    pub(crate) fn new() -> Self {
        Self {
            script: Arc::new(Script {
                handshakes: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                handshake_delay: Mutex::new(Duration::ZERO),
                send_delay: Mutex::new(Duration::ZERO),
                connect_errors: Mutex::new(VecDeque::new()),
                outcomes: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Outcome::Ok(json!({}))),
            }),
        }
    }

    /// Queue the outcome of the next unscripted send.
    pub(crate) fn push(&self, outcome: Outcome) {
        self.script.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Outcome used once the queue is empty.
    pub(crate) fn set_fallback(&self, outcome: Outcome) {
        *self.script.fallback.lock().unwrap() = outcome;
    }

    pub(crate) fn fail_next_connect(&self, error: mcp::Error) {
        self.script.connect_errors.lock().unwrap().push_back(error);
    }

    pub(crate) fn set_handshake_delay(&self, delay: Duration) {
        *self.script.handshake_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        *self.script.send_delay.lock().unwrap() = delay;
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.script.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn sends(&self) -> usize {
        self.script.sends.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }
}

impl Connector for StubConnector {
    type Transport = StubTransport;

    async fn open(&self, config: &ServerConfig, _timeout: Duration) -> mcp::Result<StubTransport> {
        self.script.handshakes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.handshake_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.script.connect_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(StubTransport {
            server: config.name.clone(),
            script: Arc::clone(&self.script),
        })
    }
}

#[derive(Debug)]
pub(crate) struct StubTransport {
    server: String,
    script: Arc<Script>,
}

impl Transport for StubTransport {
    async fn send(&self, _request: &Request, _timeout: Duration) -> mcp::Result<Value> {
        self.script.sends.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.outcomes.lock().unwrap().pop_front();
        let outcome = next.unwrap_or_else(|| self.script.fallback.lock().unwrap().clone());
        match outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(error) => Err(error),
            Outcome::Hang => {
                tracing::debug!(server = %self.server, "stub send hanging");
                std::future::pending().await
            }
        }
    }

    async fn close(&self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}
