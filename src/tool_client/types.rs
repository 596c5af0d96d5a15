//! Shared types for the tool client.
//!
//! JSON-RPC 2.0 message types, tool-server configuration, the discovered
//! tool catalog, and call/result records.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::backoff::BackoffPolicy;
use super::value::{ParamSchema, ToolValue};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// How to reach a tool server: a child process speaking JSON-RPC on stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectDescriptor {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// One tool server entry in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub connect: ConnectDescriptor,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// Declared capabilities. A hint only; the discovered catalog is authoritative.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Automatic retries on a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Overrides the global reconnect backoff for this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
}

pub(crate) fn default_call_timeout_ms() -> u64 {
    30_000
}
pub(crate) fn default_max_retries() -> u32 {
    1
}

impl ToolServerConfig {
    /// A disabled config with default limits.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            connect: ConnectDescriptor {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                cwd: None,
            },
            enabled: false,
            description: String::new(),
            capabilities: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
            max_retries: default_max_retries(),
            backoff: None,
        }
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// SHA-256 over the canonical JSON of this config.
    ///
    /// Connections remember the fingerprint they were built from, so the
    /// manager can tell when the applied config changed underneath them.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        format!("{digest:x}")
    }
}

/// Registry-wide defaults (the `global_settings` block).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub retry_attempts: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            retry_attempts: default_max_retries(),
        }
    }
}

/// On-disk registry file.
///
/// Server entries are keyed by name; the `name` field inside an entry may be
/// omitted and is filled from the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolServersFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntry>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

/// A server entry as written in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub connect: ConnectDescriptor,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
}

impl ServerEntry {
    /// Resolve into a full config, filling gaps from the global settings.
    pub fn into_config(self, key: &str, globals: &GlobalSettings) -> ToolServerConfig {
        ToolServerConfig {
            name: self.name.unwrap_or_else(|| key.to_string()),
            connect: self.connect,
            enabled: self.enabled,
            description: self.description,
            capabilities: self.capabilities,
            call_timeout_ms: self.call_timeout_ms.unwrap_or(globals.call_timeout_ms),
            max_retries: self.max_retries.unwrap_or(globals.retry_attempts),
            backoff: self.backoff,
        }
    }

    pub fn from_config(config: &ToolServerConfig) -> Self {
        Self {
            name: None,
            connect: config.connect.clone(),
            enabled: config.enabled,
            description: config.description.clone(),
            capabilities: config.capabilities.clone(),
            call_timeout_ms: Some(config.call_timeout_ms),
            max_retries: Some(config.max_retries),
            backoff: config.backoff.clone(),
        }
    }
}

// ─── Tool Catalog ────────────────────────────────────────────────────────────

/// A tool definition as returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub params_schema: serde_json::Value,
}

/// One catalog entry: description plus the parsed parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub description: String,
    pub schema: ParamSchema,
}

/// Discovered tools of one server, keyed by tool name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCatalog {
    tools: BTreeMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Self {
        let tools = definitions
            .into_iter()
            .map(|def| {
                let entry = CatalogEntry {
                    description: def.description,
                    schema: ParamSchema::from_json(&def.params_schema),
                };
                (def.name, entry)
            })
            .collect();
        Self { tools }
    }

    pub fn get(&self, tool: &str) -> Option<&CatalogEntry> {
        self.tools.get(tool)
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CatalogEntry)> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Calls and Results ───────────────────────────────────────────────────────

/// One outgoing tool invocation on a specific connection.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Unique and monotonically increasing within the connection's lifetime.
    pub request_id: u64,
    pub tool: String,
    pub params: ToolValue,
    pub timeout: Duration,
}

impl ToolCall {
    /// JSON-RPC `tools/call` params for this call.
    pub fn to_params(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.tool,
            "arguments": serde_json::Value::from(self.params.clone()),
        })
    }
}

/// Outcome of a tool call that reached the server.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub server: String,
    pub tool: String,
    /// Request id of the attempt that produced this result.
    pub request_id: u64,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub outcome: ToolOutcome,
}

/// Success payload or structured failure reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: ToolValue },
    Failure { code: i32, message: String },
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&ToolValue> {
        match &self.outcome {
            ToolOutcome::Success { payload } => Some(payload),
            ToolOutcome::Failure { .. } => None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
