//! Tool server process lifecycle.
//!
//! Spawns tool servers as child processes speaking JSON-RPC on stdio, runs
//! the discovery handshake, and shuts them down. Each server runs as a
//! separate OS process; the manager decides when to call into this module.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use super::connection::{RequestIds, ToolConnection};
use super::errors::ToolError;
use super::transport::{StdioTransport, Transport};
use super::types::{
    error_codes, InitializeResult, ListToolsResult, ToolCatalog, ToolServerConfig,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for stderr to reach EOF after a failed handshake.
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Characters of recent stderr kept for error messages.
const STDERR_MAX_CHARS: usize = 2000;

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens a raw transport to a tool server.
///
/// The manager owns discovery and state; a connector only produces a channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn Transport>, ToolError>;
}

/// Connects by spawning the configured command as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    /// Fallback working directory when a server sets no `cwd`.
    working_dir: Option<String>,
}

impl ProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn Transport>, ToolError> {
        let transport = spawn_server(config, self.working_dir.as_deref())?;
        Ok(Arc::new(transport))
    }
}

// ─── ProcessTransport ────────────────────────────────────────────────────────

/// A stdio transport bound to the child process that serves it.
pub struct ProcessTransport {
    name: String,
    stdio: StdioTransport,
    process: TokioMutex<Child>,
    exited: Mutex<bool>,
    stderr_tail: Arc<Mutex<StderrTail>>,
    stderr_task: TokioMutex<Option<JoinHandle<()>>>,
}

impl ProcessTransport {
    fn process_exited(&self) -> bool {
        *self.exited.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        self.stdio.request(id, method, params).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ToolError> {
        self.stdio.notify(method, params).await
    }

    fn is_alive(&self) -> bool {
        if !self.stdio.is_alive() || self.process_exited() {
            return false;
        }
        // Opportunistic exit check; skip if a shutdown holds the handle.
        match self.process.try_lock() {
            Ok(mut child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    *self.exited.lock().unwrap_or_else(PoisonError::into_inner) = true;
                    false
                }
            },
            Err(_) => true,
        }
    }

    async fn close(&self) {
        // Best-effort shutdown notification.
        let _ = self.stdio.notify("shutdown", None).await;

        let mut child = self.process.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.name, %status, "tool server exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "tool server did not exit, killing");
                let _ = child.kill().await;
            }
        }
        *self.exited.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.stdio.close().await;
    }

    async fn diagnostics(&self) -> String {
        if let Some(task) = self.stderr_task.lock().await.take() {
            // Wait briefly for a dying server's stderr to reach EOF.
            let _ = tokio::time::timeout(STDERR_READ_TIMEOUT, task).await;
        }
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .render()
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a tool server process with its stdio wired for JSON-RPC.
fn spawn_server(
    config: &ToolServerConfig,
    working_dir: Option<&str>,
) -> Result<ProcessTransport, ToolError> {
    let name = config.name.as_str();
    let spawn_failed = |reason: String| ToolError::Connection {
        server: name.to_string(),
        reason,
    };

    let mut cmd = Command::new(&config.connect.command);
    cmd.args(&config.connect.args);
    for (key, value) in &config.connect.env {
        cmd.env(key, value);
    }

    // Per-server cwd overrides the connector's working dir
    if let Some(dir) = config.connect.cwd.as_deref().or(working_dir) {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_failed(format!("failed to spawn '{}': {e}", config.connect.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(drain_stderr(
            name.to_string(),
            stderr,
            Arc::clone(&stderr_tail),
        ))
    });

    tracing::info!(
        server = name,
        command = %config.connect.command,
        pid = child.id().unwrap_or_default(),
        "spawned tool server"
    );

    Ok(ProcessTransport {
        name: name.to_string(),
        stdio: StdioTransport::new(name, stdin, stdout),
        process: TokioMutex::new(child),
        exited: Mutex::new(false),
        stderr_tail,
        stderr_task: TokioMutex::new(stderr_task),
    })
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// The most recent stderr output of a server, bounded to `STDERR_MAX_CHARS`.
#[derive(Debug, Default)]
struct StderrTail {
    text: String,
    dropped: bool,
}

impl StderrTail {
    fn push(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        let excess = self.text.chars().count().saturating_sub(STDERR_MAX_CHARS);
        if excess > 0 {
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map_or(self.text.len(), |(i, _)| i);
            self.text.drain(..cut);
            self.dropped = true;
        }
    }

    fn render(&self) -> String {
        if self.dropped {
            format!("(truncated)...{}", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// Read a server's stderr until EOF, logging each line and keeping the tail.
///
/// Runs for the life of the process so a chatty server never blocks on a
/// full stderr pipe.
async fn drain_stderr(server: String, stderr: ChildStderr, tail: Arc<Mutex<StderrTail>>) {
    use tokio::io::AsyncBufReadExt;

    let mut reader = tokio::io::BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                tracing::debug!(server = %server, line = %line, "tool server stderr");
                tail.lock().unwrap_or_else(PoisonError::into_inner).push(line);
            }
        }
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// Run the discovery handshake: `initialize`, then `tools/list`.
///
/// Servers that do not implement `tools/list` may publish their tools in
/// the `initialize` response instead.
pub async fn discover(
    transport: &dyn Transport,
    ids: &RequestIds,
    server: &str,
) -> Result<ToolCatalog, ToolError> {
    let init_params = serde_json::json!({
        "clientInfo": {"name": "docpipe", "version": env!("CARGO_PKG_VERSION")},
    });
    let init = transport
        .request(ids.next_id(), "initialize", Some(init_params))
        .await?;
    let init: InitializeResult = serde_json::from_value(init).map_err(|e| ToolError::Connection {
        server: server.to_string(),
        reason: format!("failed to parse initialize response: {e}"),
    })?;

    let definitions = match transport.request(ids.next_id(), "tools/list", None).await {
        Ok(listed) => {
            let listed: ListToolsResult =
                serde_json::from_value(listed).map_err(|e| ToolError::Connection {
                    server: server.to_string(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;
            listed.tools
        }
        Err(ToolError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
            init.tools
        }
        Err(e) => return Err(e),
    };

    Ok(ToolCatalog::from_definitions(definitions))
}

/// Open a transport and complete discovery within `discovery_timeout`.
///
/// The returned connection is still `Connecting`; the manager promotes it.
pub async fn establish(
    connector: &dyn Connector,
    config: &ToolServerConfig,
    discovery_timeout: Duration,
) -> Result<ToolConnection, ToolError> {
    let name = config.name.as_str();
    let transport = connector.connect(config).await?;
    let ids = RequestIds::default();

    let failure = match tokio::time::timeout(
        discovery_timeout,
        discover(transport.as_ref(), &ids, name),
    )
    .await
    {
        Ok(Ok(catalog)) => {
            tracing::info!(server = name, tools = catalog.len(), "tool server discovered");
            return Ok(ToolConnection::new(config.clone(), transport, catalog, ids));
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!(
            "discovery timed out after {}ms",
            discovery_timeout.as_millis()
        ),
    };

    let stderr_ctx = transport.diagnostics().await;
    if !stderr_ctx.is_empty() {
        tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on failure");
    }
    transport.close().await;

    Err(ToolError::Connection {
        server: name.to_string(),
        reason: format!("{failure}{}", format_stderr_suffix(&stderr_ctx)),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
