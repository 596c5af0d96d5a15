//! Tool invocation proxy.
//!
//! Executes a single tool call against a Ready connection: catalog lookup,
//! schema validation, a fresh request id per attempt, the per-call deadline,
//! and one automatic retry on timeout. Transport failures go back to the
//! connection manager; this module never changes connection state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::ToolConnection;
use super::errors::ToolError;
use super::manager::ToolConnectionManager;
use super::types::{error_codes, ToolCall, ToolOutcome, ToolResult};
use super::value::ToolValue;

/// Routes tool calls through the connection manager.
#[derive(Clone)]
pub struct ToolInvocationProxy {
    manager: Arc<ToolConnectionManager>,
}

impl ToolInvocationProxy {
    pub fn new(manager: Arc<ToolConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ToolConnectionManager> {
        &self.manager
    }

    /// Call `tool` on `server`.
    ///
    /// `timeout` defaults to the server's configured call timeout. A server
    /// that answers with an error still yields `Ok` with a
    /// [`ToolOutcome::Failure`]; `Err` means the call never got an answer.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        params: ToolValue,
        timeout: Option<Duration>,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let conn = self.manager.acquire(server).await?;

        let entry = conn.catalog().get(tool).ok_or_else(|| ToolError::UnknownTool {
            server: server.to_string(),
            tool: tool.to_string(),
        })?;
        entry
            .schema
            .validate(&params)
            .map_err(|reason| ToolError::InvalidArguments {
                tool: tool.to_string(),
                reason,
            })?;

        let timeout = timeout.unwrap_or_else(|| conn.config().call_timeout());
        let max_retries = conn.config().max_retries;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let call = ToolCall {
                request_id: conn.next_request_id(),
                tool: tool.to_string(),
                params: params.clone(),
                timeout,
            };

            match dispatch(&conn, &call).await {
                Ok(outcome) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    tracing::debug!(
                        server,
                        tool,
                        request_id = call.request_id,
                        attempts,
                        elapsed_ms,
                        "tool call finished"
                    );
                    return Ok(ToolResult {
                        server: server.to_string(),
                        tool: tool.to_string(),
                        request_id: call.request_id,
                        attempts,
                        elapsed_ms,
                        outcome,
                    });
                }
                Err(e) if e.is_transient() && attempts <= max_retries && conn.is_ready() => {
                    tracing::warn!(
                        server,
                        tool,
                        request_id = call.request_id,
                        error = %e,
                        "tool call timed out, retrying"
                    );
                }
                Err(e) => {
                    if e.is_transport_failure() {
                        tracing::warn!(server, tool, error = %e, "transport failure during tool call");
                        self.manager.request_health_check(server);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// [`Self::call`] taking and returning plain JSON arguments.
    pub async fn call_json(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<ToolResult, ToolError> {
        self.call(server, tool, ToolValue::from(arguments), timeout)
            .await
    }
}

/// Send one attempt and wait for its correlated response or the deadline.
async fn dispatch(conn: &ToolConnection, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
    let response = tokio::time::timeout(
        call.timeout,
        conn.transport()
            .request(call.request_id, "tools/call", Some(call.to_params())),
    )
    .await;

    match response {
        Err(_) => Err(ToolError::Timeout {
            tool: call.tool.clone(),
            timeout_ms: call.timeout.as_millis() as u64,
        }),
        Ok(Ok(value)) => Ok(outcome_from_result(value)),
        Ok(Err(ToolError::ServerError { code, message, .. })) => {
            Ok(ToolOutcome::Failure { code, message })
        }
        Ok(Err(e)) => Err(e),
    }
}

/// Tool servers flag tool-level failures with `isError` inside a result.
fn outcome_from_result(value: serde_json::Value) -> ToolOutcome {
    if value.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        let message = value
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|items| items.iter().find_map(|item| item.get("text")?.as_str()))
            .unwrap_or("tool reported an error")
            .to_string();
        return ToolOutcome::Failure {
            code: error_codes::INTERNAL_ERROR,
            message,
        };
    }
    ToolOutcome::Success {
        payload: ToolValue::from(value),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
