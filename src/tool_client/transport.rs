//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with tool servers:
//! - Writing line-delimited JSON-RPC requests to the server's stdin
//! - A background reader that demultiplexes responses by request id
//! - Failing every in-flight request when the server's stdout closes
//!
//! Request ids are assigned by the caller (the owning connection), so
//! uniqueness is scoped to one connection's lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use super::errors::ToolError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A request/response channel to one tool server.
///
/// Implementations must allow concurrent `request` calls; each call waits
/// only for the response carrying its own id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request with the given id and wait for its correlated result.
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>)
        -> Result<(), ToolError>;

    /// Whether the underlying channel is still open.
    fn is_alive(&self) -> bool;

    /// Release the channel and any process behind it.
    async fn close(&self);

    /// Whatever the far side wrote outside the protocol (e.g. stderr),
    /// used to enrich connection errors. Empty when unavailable.
    async fn diagnostics(&self) -> String {
        String::new()
    }
}

// ─── Pending Requests ────────────────────────────────────────────────────────

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a waiter from the pending map when its request is dropped
/// (timeout or cancellation), so late responses are discarded.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a pair of byte streams
/// (normally a child process's stdin/stdout).
pub struct StdioTransport {
    server_name: String,
    writer: TokioMutex<BoxedWriter>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its response reader.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_responses(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: TokioMutex::new(Box::new(writer)),
            pending,
            closed,
            reader_task,
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    fn lost(&self, reason: impl Into<String>) -> ToolError {
        ToolError::ConnectionLost {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    async fn write_line(&self, mut json: String) -> Result<(), ToolError> {
        json.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.lost(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.lost(format!("failed to flush stdin: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.lost("transport closed"));
        }

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader may have shut down between the check above and the insert.
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.lost("transport closed"));
        }

        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.lost(format!("failed to serialize request: {e}")))?;
        self.write_line(json).await?;

        let response = rx
            .await
            .map_err(|_| self.lost("server stdout closed (process may have exited)"))?;

        extract_result(response)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ToolError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let json = serde_json::to_string(&notification)
            .map_err(|e| self.lost(format!("failed to serialize notification: {e}")))?;
        self.write_line(json).await
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_task.abort();
        lock_pending(&self.pending).clear();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Read response lines until EOF, handing each to the waiter with its id.
async fn read_responses<R>(
    server: String,
    reader: R,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line_buf = String::new();

    loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read from server stdout");
                break;
            }
        }

        let trimmed = line_buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(resp) => {
                let waiter = lock_pending(&pending).remove(&resp.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => tracing::debug!(
                        server = %server,
                        request_id = resp.id,
                        "discarding response with no waiter"
                    ),
                }
            }
            // Not a response; servers commonly log to stdout.
            Err(_) => tracing::trace!(server = %server, line = trimmed, "skipping non-response line"),
        }
    }

    tracing::debug!(server = %server, "server stdout closed");
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiter with ConnectionLost.
    lock_pending(&pending).clear();
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `ToolError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, ToolError> {
    if let Some(err) = response.error {
        return Err(ToolError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(ToolError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
