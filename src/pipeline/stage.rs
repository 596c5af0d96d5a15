//! The stage seam and the context handed to each stage.

use std::time::Duration;

use async_trait::async_trait;

use crate::tool_client::{ToolError, ToolInvocationProxy, ToolResult, ToolValue};

use super::errors::{StageError, TimeoutScope};
use super::types::{Event, EventKind};

/// One pipeline unit: consumes the previous stage's event, produces the next.
///
/// `handle` may suspend (e.g. on tool calls) and must return exactly one
/// event of `output_kind()` or fail. The engine never retries a stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn input_kind(&self) -> EventKind;

    fn output_kind(&self) -> EventKind;

    async fn handle(&self, input: &Event, ctx: &StageContext) -> Result<Event, StageError>;
}

/// What a stage can see besides its input event.
#[derive(Clone)]
pub struct StageContext {
    document_id: String,
    tools: Option<ToolInvocationProxy>,
}

impl StageContext {
    pub fn new(document_id: impl Into<String>, tools: Option<ToolInvocationProxy>) -> Self {
        Self {
            document_id: document_id.into(),
            tools,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Whether tool servers are wired into this run.
    pub fn has_tools(&self) -> bool {
        self.tools.is_some()
    }

    /// Call a tool through the invocation proxy.
    ///
    /// A call timeout (after the proxy's retry) becomes a call-scoped
    /// [`StageError::Timeout`]; other tool failures pass through as
    /// [`StageError::Tool`].
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        params: ToolValue,
        timeout: Option<Duration>,
    ) -> Result<ToolResult, StageError> {
        let proxy = self.tools.as_ref().ok_or_else(|| ToolError::Configuration {
            reason: "no tool servers configured for this pipeline".into(),
        })?;

        proxy
            .call(server, tool, params, timeout)
            .await
            .map_err(|e| match e {
                ToolError::Timeout { timeout_ms, .. } => StageError::Timeout {
                    scope: TimeoutScope::Call,
                    timeout_ms,
                },
                other => StageError::Tool(other),
            })
    }
}
