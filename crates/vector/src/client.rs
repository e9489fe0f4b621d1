//! Framed-RPC client for the embedding-store process.
//!
//! Wire format: 4-byte big-endian length prefix, then a JSON object.
//! Requests are `{"id", "op", "params"}`; responses `{"id", "ok",
//! "result" | "error"}`. The connection is lazy and singleton; a transport
//! error tears it down, and the next call respawns/reconnects (with
//! exponential backoff between consecutive failures) and retries once.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use cm_domain::error::{Error, Result};

/// Executable spawned in local mode. Resolved via `PATH`.
const STORE_PROGRAM: &str = "chroma-rpc";

/// Backoff cap between respawn attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the embedding store lives.
#[derive(Debug, Clone)]
pub enum VectorEndpoint {
    /// Spawn the store as a child process, persisting under `data_path`.
    Subprocess { data_path: PathBuf },
    /// Connect to an already-running store over TCP.
    Remote {
        host: String,
        port: u16,
        api_key: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Transport {
    Child {
        child: Child,
        writer: FramedWrite<ChildStdin, LengthDelimitedCodec>,
        reader: FramedRead<ChildStdout, LengthDelimitedCodec>,
    },
    Tcp {
        writer: FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>,
        reader: FramedRead<Box<dyn AsyncRead + Send + Unpin>, LengthDelimitedCodec>,
    },
}

impl Transport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let result = match self {
            Transport::Child { writer, .. } => writer.send(frame.into()).await,
            Transport::Tcp { writer, .. } => writer.send(frame.into()).await,
        };
        result.map_err(|e| Error::Vector(format!("write failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let frame = match self {
            Transport::Child { reader, .. } => reader.next().await,
            Transport::Tcp { reader, .. } => reader.next().await,
        };
        match frame {
            Some(Ok(bytes)) => Ok(bytes.to_vec()),
            Some(Err(e)) => Err(Error::Vector(format!("read failed: {e}"))),
            None => Err(Error::Vector("connection closed".into())),
        }
    }

    async fn shutdown(mut self) {
        if let Transport::Child { ref mut child, .. } = self {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ClientState {
    transport: Option<Transport>,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

pub struct VectorClient {
    endpoint: VectorEndpoint,
    state: tokio::sync::Mutex<ClientState>,
    next_request_id: AtomicU64,
}

impl VectorClient {
    pub fn new(endpoint: VectorEndpoint) -> Self {
        Self {
            endpoint,
            state: tokio::sync::Mutex::new(ClientState {
                transport: None,
                consecutive_failures: 0,
                retry_after: None,
            }),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Issue one RPC. Transparently (re)connects; on a transport error the
    /// connection is dropped and the call is retried exactly once.
    pub async fn call(&self, op: &str, params: Value) -> Result<Value> {
        let mut state = self.state.lock().await;

        match self.call_locked(&mut state, op, &params).await {
            Ok(result) => Ok(result),
            Err(e) if is_transport(&e) => {
                tracing::warn!(op, error = %e, "vector transport error, reconnecting once");
                if let Some(t) = state.transport.take() {
                    t.shutdown().await;
                }
                self.call_locked(&mut state, op, &params).await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the connection and kill the child, if any. Called on shutdown.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(t) = state.transport.take() {
            t.shutdown().await;
        }
    }

    async fn call_locked(
        &self,
        state: &mut ClientState,
        op: &str,
        params: &Value,
    ) -> Result<Value> {
        self.ensure_connected(state).await?;
        let transport = state
            .transport
            .as_mut()
            .ok_or_else(|| Error::Vector("no transport".into()))?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "id": id, "op": op, "params": params });
        let outcome = async {
            transport.send(serde_json::to_vec(&request)?).await?;
            loop {
                let raw = transport.recv().await?;
                let reply: Value = serde_json::from_slice(&raw)?;
                // Frames for other request ids cannot happen (calls are
                // serialized), but skip defensively rather than erroring.
                if reply.get("id").and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                if reply.get("ok").and_then(Value::as_bool) == Some(true) {
                    return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
                }
                let message = reply
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::Vector(format!("{op}: {message}")));
            }
        }
        .await;

        match &outcome {
            Ok(_) => {
                state.consecutive_failures = 0;
                state.retry_after = None;
            }
            Err(e) if is_transport(e) => {
                state.consecutive_failures += 1;
                let backoff = backoff_for(state.consecutive_failures);
                state.retry_after = Some(Instant::now() + backoff);
                tracing::warn!(
                    failures = state.consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "vector store call failed, backing off"
                );
            }
            Err(_) => {}
        }
        outcome
    }

    async fn ensure_connected(&self, state: &mut ClientState) -> Result<()> {
        if state.transport.is_some() {
            return Ok(());
        }
        if let Some(at) = state.retry_after {
            if Instant::now() < at {
                return Err(Error::Vector("backing off after repeated failures".into()));
            }
        }

        let transport = match &self.endpoint {
            VectorEndpoint::Subprocess { data_path } => {
                let mut child = Command::new(STORE_PROGRAM)
                    .arg("--path")
                    .arg(data_path)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| Error::Vector(format!("spawning {STORE_PROGRAM}: {e}")))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Vector("child stdin unavailable".into()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Vector("child stdout unavailable".into()))?;
                tracing::info!(pid = child.id(), "vector store subprocess spawned");
                Transport::Child {
                    child,
                    writer: FramedWrite::new(stdin, codec()),
                    reader: FramedRead::new(stdout, codec()),
                }
            }
            VectorEndpoint::Remote { host, port, .. } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::Vector(format!("connecting {host}:{port}: {e}")))?;
                let (read_half, write_half) = stream.into_split();
                tracing::info!(host = %host, port, "vector store connected");
                Transport::Tcp {
                    writer: FramedWrite::new(Box::new(write_half), codec()),
                    reader: FramedRead::new(Box::new(read_half), codec()),
                }
            }
        };

        // Remote stores authenticate with a hello frame before any other op.
        let mut transport = transport;
        if let VectorEndpoint::Remote {
            api_key: Some(key), ..
        } = &self.endpoint
        {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let hello = json!({ "id": id, "op": "hello", "params": { "api_key": key } });
            transport.send(serde_json::to_vec(&hello)?).await?;
            let raw = transport.recv().await?;
            let reply: Value = serde_json::from_slice(&raw)?;
            if reply.get("ok").and_then(Value::as_bool) != Some(true) {
                transport.shutdown().await;
                return Err(Error::Vector("remote store rejected api key".into()));
            }
        }

        state.transport = Some(transport);
        Ok(())
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(16 * 1024 * 1024)
        .new_codec()
}

fn is_transport(e: &Error) -> bool {
    match e {
        Error::Vector(msg) => {
            msg.contains("write failed")
                || msg.contains("read failed")
                || msg.contains("connection closed")
                || msg.contains("spawning")
                || msg.contains("connecting")
        }
        Error::Io(_) => true,
        _ => false,
    }
}

fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    (Duration::from_millis(500) * 2u32.pow(exp)).min(MAX_BACKOFF)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
