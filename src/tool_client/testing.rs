//! In-memory tool server doubles for tests.
//!
//! A [`ScriptedServer`] answers the discovery handshake, `ping`, and
//! `tools/call` with scripted latency, payloads, and failures, and records
//! every request it sees. [`ScriptedConnector`] hands out transports to
//! registered scripted servers and counts connection attempts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Settings;
use crate::status::StatusFeed;

use super::backoff::BackoffPolicy;
use super::errors::ToolError;
use super::lifecycle::Connector;
use super::manager::ToolConnectionManager;
use super::registry::ToolServerRegistry;
use super::transport::Transport;
use super::types::{error_codes, ToolServerConfig};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── ScriptedServer ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    tools: Vec<Value>,
    tools_in_initialize_only: bool,
    handshake_delay: Duration,
    latency: HashMap<String, Duration>,
    latency_queue: HashMap<String, VecDeque<Duration>>,
    responses: HashMap<String, Value>,
    errors: HashMap<String, (i32, String)>,
    methods: Vec<String>,
    ids: Vec<u64>,
    calls: HashMap<String, Vec<u64>>,
}

struct ServerState {
    name: String,
    script: Mutex<Script>,
    /// Bumped by `kill`; transports from older generations are dead.
    generation: AtomicU32,
    ping_failing: AtomicBool,
    unreachable: AtomicBool,
    failing_connects: AtomicU32,
    closed: AtomicBool,
}

/// A scripted tool server. Clones share state.
#[derive(Clone)]
pub struct ScriptedServer {
    state: Arc<ServerState>,
}

impl ScriptedServer {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(ServerState {
                name: name.to_string(),
                script: Mutex::new(Script::default()),
                generation: AtomicU32::new(0),
                ping_failing: AtomicBool::new(false),
                unreachable: AtomicBool::new(false),
                failing_connects: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        lock(&self.state.script)
    }

    // ─── Builders ────────────────────────────────────────────────────────

    pub fn with_tool(self, tool: &str, schema: Value) -> Self {
        self.script()
            .tools
            .push(json!({"name": tool, "description": "", "inputSchema": schema}));
        self
    }

    pub fn with_described_tool(self, tool: &str, description: &str) -> Self {
        self.script()
            .tools
            .push(json!({"name": tool, "description": description, "inputSchema": {}}));
        self
    }

    /// Publish tools in the `initialize` result and reject `tools/list`.
    pub fn tools_in_initialize_only(self) -> Self {
        self.script().tools_in_initialize_only = true;
        self
    }

    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        self.script().handshake_delay = delay;
        self
    }

    /// Latency for every call to `tool`.
    pub fn with_latency(self, tool: &str, latency: Duration) -> Self {
        self.script().latency.insert(tool.to_string(), latency);
        self
    }

    /// Latencies for the next calls to `tool`, in order; then the default.
    pub fn with_latencies(self, tool: &str, latencies: Vec<Duration>) -> Self {
        self.script()
            .latency_queue
            .insert(tool.to_string(), latencies.into());
        self
    }

    pub fn with_response(self, tool: &str, response: Value) -> Self {
        self.script().responses.insert(tool.to_string(), response);
        self
    }

    pub fn with_error(self, tool: &str, code: i32, message: &str) -> Self {
        self.script()
            .errors
            .insert(tool.to_string(), (code, message.to_string()));
        self
    }

    /// Refuse every connection attempt.
    pub fn unreachable(self) -> Self {
        self.set_unreachable(true);
        self
    }

    /// Refuse the next `count` connection attempts.
    pub fn failing_connects(self, count: u32) -> Self {
        self.state.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    // ─── Runtime controls ────────────────────────────────────────────────

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_ping_failing(&self, failing: bool) {
        self.state.ping_failing.store(failing, Ordering::SeqCst);
    }

    /// Kill every transport handed out so far.
    pub fn kill(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// A transport bound to this server.
    pub fn transport(&self) -> ScriptedTransport {
        ScriptedTransport {
            server: self.clone(),
            generation: self.state.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }
    }

    // ─── Inspection ──────────────────────────────────────────────────────

    pub fn seen_methods(&self) -> Vec<String> {
        self.script().methods.clone()
    }

    pub fn seen_ids(&self) -> Vec<u64> {
        self.script().ids.clone()
    }

    /// Request ids of `tools/call` requests for `tool` that reached the server.
    pub fn call_ids(&self, tool: &str) -> Vec<u64> {
        self.script().calls.get(tool).cloned().unwrap_or_default()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.call_ids(tool).len()
    }

    /// Whether any transport to this server was closed.
    pub fn was_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn tool_definitions(&self) -> Vec<Value> {
        self.script().tools.clone()
    }

    async fn handle(&self, id: u64, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        match method {
            "initialize" => {
                let (delay, init_only) = {
                    let script = self.script();
                    (script.handshake_delay, script.tools_in_initialize_only)
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let tools = if init_only { self.tool_definitions() } else { Vec::new() };
                Ok(json!({
                    "capabilities": {},
                    "tools": tools,
                    "serverInfo": {"name": self.name(), "version": "test"},
                }))
            }
            "tools/list" => {
                if self.script().tools_in_initialize_only {
                    return Err(server_error(error_codes::METHOD_NOT_FOUND, "Method not found"));
                }
                Ok(json!({"tools": self.tool_definitions()}))
            }
            "ping" => {
                if self.state.ping_failing.load(Ordering::SeqCst) {
                    Err(ToolError::ConnectionLost {
                        server: self.name().to_string(),
                        reason: "ping failed".into(),
                    })
                } else {
                    Ok(json!({}))
                }
            }
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params["arguments"].clone();

                let (latency, response, error) = {
                    let mut script = self.script();
                    script.calls.entry(tool.clone()).or_default().push(id);
                    let queued = script
                        .latency_queue
                        .get_mut(&tool)
                        .and_then(|queue| queue.pop_front());
                    let latency = queued
                        .or_else(|| script.latency.get(&tool).copied())
                        .unwrap_or_default();
                    (
                        latency,
                        script.responses.get(&tool).cloned(),
                        script.errors.get(&tool).cloned(),
                    )
                };

                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                if let Some((code, message)) = error {
                    return Err(server_error(code, &message));
                }
                Ok(response.unwrap_or_else(|| {
                    json!({"tool": tool, "arguments": arguments, "request_id": id})
                }))
            }
            _ => Err(server_error(error_codes::METHOD_NOT_FOUND, "Method not found")),
        }
    }
}

fn server_error(code: i32, message: &str) -> ToolError {
    ToolError::ServerError {
        code,
        message: message.to_string(),
        data: None,
    }
}

// ─── ScriptedTransport ───────────────────────────────────────────────────────

/// A transport that answers from a [`ScriptedServer`].
pub struct ScriptedTransport {
    server: ScriptedServer,
    generation: u32,
    closed: AtomicBool,
}

impl ScriptedTransport {
    /// A transport to a fresh server with no tools.
    pub fn healthy(name: &str) -> Self {
        ScriptedServer::new(name).transport()
    }

    pub fn seen_methods(&self) -> Vec<String> {
        self.server.seen_methods()
    }

    fn lost(&self) -> ToolError {
        ToolError::ConnectionLost {
            server: self.server.name().to_string(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, id: u64, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        {
            let mut script = self.server.script();
            script.methods.push(method.to_string());
            script.ids.push(id);
        }
        if !self.is_alive() {
            return Err(self.lost());
        }
        self.server.handle(id, method, params).await
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), ToolError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(self.lost())
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.server.state.generation.load(Ordering::SeqCst) == self.generation
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.server.state.closed.store(true, Ordering::SeqCst);
    }

    async fn diagnostics(&self) -> String {
        format!("{} test stderr", self.server.name())
    }
}

// ─── ScriptedConnector ───────────────────────────────────────────────────────

/// Connects to registered scripted servers by name.
#[derive(Default)]
pub struct ScriptedConnector {
    servers: Mutex<HashMap<String, ScriptedServer>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, server: ScriptedServer) -> Self {
        lock(&self.servers).insert(server.name().to_string(), server);
        self
    }

    /// Connection attempts made for `server` so far.
    pub fn attempts(&self, server: &str) -> u32 {
        lock(&self.attempts).get(server).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn Transport>, ToolError> {
        *lock(&self.attempts).entry(config.name.clone()).or_default() += 1;

        let refused = |reason: &str| ToolError::Connection {
            server: config.name.clone(),
            reason: reason.to_string(),
        };
        let server = lock(&self.servers)
            .get(&config.name)
            .cloned()
            .ok_or_else(|| refused("no such server"))?;

        if server.state.unreachable.load(Ordering::SeqCst) {
            return Err(refused("connection refused"));
        }
        let remaining = server.state.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            server.state.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(refused("connection refused"));
        }
        Ok(Arc::new(server.transport()))
    }
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

/// Settings with short, jitter-free backoff.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.backoff = BackoffPolicy {
        base_delay_ms: 10,
        max_delay_ms: 100,
        max_attempts: 4,
        jitter: 0.0,
    };
    settings.connection.discovery_timeout_ms = 1_000;
    settings.connection.probe_timeout_ms = 100;
    settings
}

/// A manager over an applied registry with every given server enabled.
pub fn manager_for(
    servers: &[ScriptedServer],
) -> (Arc<ToolConnectionManager>, Arc<ScriptedConnector>) {
    let registry = ToolServerRegistry::new();
    let mut connector = ScriptedConnector::new();
    for server in servers {
        registry
            .add(ToolServerConfig::new(server.name(), "scripted", &[]).enabled())
            .unwrap();
        connector = connector.with_server(server.clone());
    }
    registry.apply();

    let connector = Arc::new(connector);
    let manager = ToolConnectionManager::new(
        Arc::new(registry),
        Arc::clone(&connector) as Arc<dyn Connector>,
        fast_settings(),
        StatusFeed::default(),
    );
    (manager, connector)
}
