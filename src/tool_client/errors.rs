//! Tool client error types.

use thiserror::Error;

/// Errors that can occur while managing tool servers or invoking tools.
///
/// `Clone` so that one connection attempt's outcome can be handed to every
/// caller that awaited it.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Invalid or conflicting tool-server configuration.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Transport failure or discovery timeout while establishing a connection.
    #[error("connection to '{server}' failed: {reason}")]
    Connection { server: String, reason: String },

    /// Tool absent from the server's discovered catalog.
    #[error("unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },

    /// Call parameters failed validation against the discovered schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// No correlated response arrived before the deadline.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The transport failed while a call was in flight.
    #[error("connection to '{server}' lost: {reason}")]
    ConnectionLost { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Connection is degraded and excluded from routing until it reconnects.
    #[error("server '{server}' is degraded after {failures} consecutive failures")]
    Degraded { server: String, failures: u32 },

    /// Every reconnect attempt was exhausted; requires a manual refresh.
    #[error("server '{server}' unavailable after {attempts} connection attempts")]
    Unavailable { server: String, attempts: u32 },
}

impl ToolError {
    /// Whether the invocation proxy retries this failure once on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }

    /// Whether this failure says something about the connection's health.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ToolError::ConnectionLost { .. } | ToolError::Connection { .. }
        )
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Configuration {
            reason: format!("serialization error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_transient() {
        assert!(ToolError::Timeout {
            tool: "read_file".into(),
            timeout_ms: 100,
        }
        .is_transient());
        assert!(!ToolError::ConnectionLost {
            server: "fs".into(),
            reason: "eof".into(),
        }
        .is_transient());
        assert!(!ToolError::UnknownTool {
            server: "fs".into(),
            tool: "nope".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_display_names_server_and_tool() {
        let err = ToolError::UnknownTool {
            server: "memory".into(),
            tool: "search".into(),
        };
        assert_eq!(err.to_string(), "unknown tool 'search' on server 'memory'");
    }
}
