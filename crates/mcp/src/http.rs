//! HTTP transport: JSON-RPC over POST, with optional session header and
//! single-message SSE responses.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Error, Phase, Result};
use crate::protocol::{InitializeResult, JsonRpcNotification, JsonRpcResponse, Request};
use crate::transport::CLIENT_NAME;

/// Header carrying the server-issued session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Session with an HTTP MCP endpoint.
pub struct HttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build the client and complete the `initialize` handshake.
    pub async fn open(config: &ServerConfig, timeout: Duration) -> Result<Self> {
        let transport = Self::build(config)?;

        match tokio::time::timeout(timeout, transport.handshake(timeout)).await {
            Ok(Ok(())) => Ok(transport),
            Ok(Err(Error::ConnectionTimeout { .. })) | Err(_) => {
                Err(Error::timeout(&config.name, Phase::Handshake, timeout))
            }
            Ok(Err(e)) => Err(Error::failure(&config.name, format!("handshake failed: {e}"))),
        }
    }

    fn build(config: &ServerConfig) -> Result<Self> {
        let name = &config.name;
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Configuration(format!("servers.{name}.url is not set")))?;

        let mut headers = HeaderMap::new();
        // MCP servers require Accept header for both JSON and SSE
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        for (key, value) in &config.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                Error::Configuration(format!("servers.{name}.headers: invalid name '{key}': {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::Configuration(format!("servers.{name}.headers: invalid value for '{key}': {e}"))
            })?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::failure(name, format!("failed to create http client: {e}")))?;

        Ok(Self {
            server: name.clone(),
            url,
            client,
            session_id: Mutex::new(None),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    async fn handshake(&self, timeout: Duration) -> Result<()> {
        let result = self
            .exchange(&Request::initialize(CLIENT_NAME), timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            self.http_error(None, format!("malformed initialize result: {e}"))
        })?;

        self.post(&JsonRpcNotification::new("notifications/initialized"), timeout)
            .await?;

        info!(
            server = %self.server,
            peer = init.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown"),
            session = self.session().is_some(),
            "http handshake complete"
        );
        Ok(())
    }

    /// POST a request and return its result.
    pub async fn send(&self, request: &Request, timeout: Duration) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::lost(&self.server, "transport closed"));
        }
        tokio::time::timeout(timeout, self.exchange(request, timeout))
            .await
            .map_err(|_| Error::timeout(&self.server, Phase::Request, timeout))?
    }

    /// End the session. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .timeout(CLOSE_TIMEOUT)
            .send()
            .await;
        debug!(server = %self.server, ok = result.is_ok(), "http session closed");
    }

    async fn exchange(&self, request: &Request, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post(&request.to_json_rpc(id), timeout)
            .await?
            .ok_or_else(|| self.http_error(None, "empty response to request".into()))?;

        if !response.is_response_to(id) {
            return Err(Error::transport(
                &self.server,
                format!("response id {:?} does not match request {id}", response.id),
            ));
        }
        response.into_result().map_err(|error| Error::Rejected {
            server: self.server.clone(),
            error,
        })
    }

    async fn post(&self, body: &impl Serialize, timeout: Duration) -> Result<Option<JsonRpcResponse>> {
        let session = self.session();
        let mut builder = self.client.post(&self.url).json(body).timeout(timeout);
        if let Some(session) = &session {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.classify(e, timeout))?;

        if let Some(issued) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(issued.to_string());
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && session.is_some() {
            return Err(Error::lost(&self.server, "session expired"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.http_error(Some(status.as_u16()), truncate(&text)));
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| self.classify(e, timeout))?;

        if text.trim().is_empty() {
            return Ok(None);
        }
        if is_sse {
            return parse_event_stream(&text)
                .ok_or_else(|| self.http_error(Some(status.as_u16()), "no JSON-RPC message in event stream".into()))
                .map(Some);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| self.http_error(Some(status.as_u16()), format!("invalid JSON-RPC body: {e}")))
    }

    fn session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn classify(&self, e: reqwest::Error, timeout: Duration) -> Error {
        if e.is_timeout() {
            Error::timeout(&self.server, Phase::Request, timeout)
        } else if e.is_connect() {
            Error::lost(&self.server, format!("connect failed: {e}"))
        } else {
            self.http_error(e.status().map(|s| s.as_u16()), e.to_string())
        }
    }

    fn http_error(&self, status: Option<u16>, message: String) -> Error {
        Error::HttpTransport {
            server: self.server.clone(),
            status,
            message,
        }
    }
}

/// Pick the first JSON-RPC response out of an SSE body.
fn parse_event_stream(body: &str) -> Option<JsonRpcResponse> {
    body.replace("\r\n", "\n")
        .split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if data.is_empty() {
                None
            } else {
                serde_json::from_str::<JsonRpcResponse>(&data.join("\n")).ok()
            }
        })
        .find(|message| message.id.is_some())
}

fn truncate(text: &str) -> String {
    const MAX: usize = 200;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
