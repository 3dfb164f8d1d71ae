//! Subprocess transport: newline-delimited JSON-RPC over stdin/stdout.

use std::io::ErrorKind as IoErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Error, Phase, Result};
use crate::protocol::{InitializeResult, JsonRpcNotification, JsonRpcResponse, Request};
use crate::transport::CLIENT_NAME;

/// Maximum size of a single response line (1MB).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Handle to a running server process.
pub struct StdioTransport {
    server: String,
    process: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<LineReader>,
    next_id: AtomicI64,
    closed: AtomicBool,
    /// Set when a write was abandoned midway; stdin framing is lost.
    broken: AtomicBool,
}

/// Stdout plus the bytes of a line not yet terminated. Keeping the partial
/// line here lets an abandoned read resume where it stopped.
struct LineReader {
    stdout: BufReader<ChildStdout>,
    pending: Vec<u8>,
}

impl StdioTransport {
    /// Spawn the server process and complete the `initialize` handshake.
    pub async fn open(config: &ServerConfig, timeout: Duration) -> Result<Self> {
        let transport = Self::spawn(config)?;

        match tokio::time::timeout(timeout, transport.handshake()).await {
            Ok(Ok(())) => Ok(transport),
            Ok(Err(e)) => {
                transport.close().await;
                Err(match e {
                    Error::ConnectionFailure { .. } => e,
                    other => Error::failure(&config.name, format!("handshake failed: {other}")),
                })
            }
            Err(_) => {
                transport.close().await;
                Err(Error::timeout(&config.name, Phase::Handshake, timeout))
            }
        }
    }

    fn spawn(config: &ServerConfig) -> Result<Self> {
        let name = config.name.clone();
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| Error::Configuration(format!("servers.{name}.command is not set")))?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut process = cmd
            .spawn()
            .map_err(|e| Error::failure(&name, format!("failed to spawn '{command}': {e}")))?;

        let stdin = process.stdin.take().ok_or_else(|| Error::StdioProcess {
            server: name.clone(),
            message: "failed to capture stdin".into(),
            exit_code: None,
        })?;

        let stdout = process.stdout.take().ok_or_else(|| Error::StdioProcess {
            server: name.clone(),
            message: "failed to capture stdout".into(),
            exit_code: None,
        })?;

        debug!(server = %name, command, "spawned server process");

        Ok(Self {
            server: name,
            process: Mutex::new(process),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(LineReader {
                stdout: BufReader::new(stdout),
                pending: Vec::new(),
            }),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        })
    }

    async fn handshake(&self) -> Result<()> {
        let result = self.exchange(&Request::initialize(CLIENT_NAME)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| Error::StdioProcess {
                server: self.server.clone(),
                message: format!("malformed initialize result: {e}"),
                exit_code: None,
            })?;

        let initialized = serde_json::to_string(&JsonRpcNotification::new(
            "notifications/initialized",
        ))
        .map_err(|e| Error::transport(&self.server, e.to_string()))?;
        self.write_line(&initialized).await?;

        info!(
            server = %self.server,
            peer = init.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown"),
            "stdio handshake complete"
        );
        Ok(())
    }

    /// Send a request and wait for the matching response.
    pub async fn send(&self, request: &Request, timeout: Duration) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::lost(&self.server, "transport closed"));
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::lost(&self.server, "request interrupted mid-write"));
        }
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| Error::timeout(&self.server, Phase::Request, timeout))?
    }

    /// Kill the server process. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut process = self.process.lock().await;
        let _ = process.kill().await;
        debug!(server = %self.server, "server process stopped");
    }

    async fn exchange(&self, request: &Request) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&request.to_json_rpc(id))
            .map_err(|e| Error::transport(&self.server, format!("serialize request: {e}")))?;

        self.write_line(&line).await?;
        let response = self.read_response(id).await?;

        response.into_result().map_err(|error| Error::Rejected {
            server: self.server.clone(),
            error,
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let unfinished = UnfinishedWrite::arm(&self.broken);
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        unfinished.disarm();

        written.map_err(|e| match e.kind() {
            IoErrorKind::BrokenPipe | IoErrorKind::ConnectionReset => {
                Error::lost(&self.server, format!("write failed: {e}"))
            }
            _ => Error::transport(&self.server, format!("write failed: {e}")),
        })
    }

    /// Read lines until the response for `id` arrives.
    ///
    /// Notifications and late responses to abandoned requests are skipped.
    async fn read_response(&self, id: i64) -> Result<JsonRpcResponse> {
        let mut reader = self.stdout.lock().await;
        let reader = &mut *reader;

        loop {
            let bytes_read = reader
                .stdout
                .read_until(b'\n', &mut reader.pending)
                .await
                .map_err(|e| Error::lost(&self.server, format!("read failed: {e}")))?;

            if bytes_read == 0 {
                return Err(self.exited().await);
            }
            if reader.pending.last() != Some(&b'\n') {
                continue;
            }
            let line = String::from_utf8(std::mem::take(&mut reader.pending)).map_err(|e| {
                Error::StdioProcess {
                    server: self.server.clone(),
                    message: format!("invalid UTF-8 output: {e}"),
                    exit_code: None,
                }
            })?;

            if line.len() > MAX_OUTPUT_SIZE {
                return Err(Error::StdioProcess {
                    server: self.server.clone(),
                    message: format!(
                        "output too large: {} bytes (max {MAX_OUTPUT_SIZE})",
                        line.len()
                    ),
                    exit_code: None,
                });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response: JsonRpcResponse =
                serde_json::from_str(trimmed).map_err(|e| Error::StdioProcess {
                    server: self.server.clone(),
                    message: format!("invalid JSON-RPC output: {e}"),
                    exit_code: None,
                })?;

            if response.is_response_to(id) {
                return Ok(response);
            }
            debug!(server = %self.server, expected = id, got = ?response.id, "skipping unrelated message");
        }
    }

    async fn exited(&self) -> Error {
        let status = self.process.lock().await.try_wait().ok().flatten();
        match status.and_then(|s| s.code()) {
            Some(code) => Error::lost(&self.server, format!("server exited with status {code}")),
            None => Error::lost(&self.server, "server closed stdout"),
        }
    }
}

/// Marks the transport broken if dropped before [`disarm`](Self::disarm).
struct UnfinishedWrite<'a>(Option<&'a AtomicBool>);

impl<'a> UnfinishedWrite<'a> {
    fn arm(broken: &'a AtomicBool) -> Self {
        Self(Some(broken))
    }

    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for UnfinishedWrite<'_> {
    fn drop(&mut self) {
        if let Some(broken) = self.0 {
            broken.store(true, Ordering::Release);
        }
    }
}
