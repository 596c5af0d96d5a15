//! Pipeline error types.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::tool_client::ToolError;

use super::types::{Event, EventKind};

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// One tool call (after the proxy's retry).
    Call,
    /// All the work of one stage.
    Stage,
    /// The whole pipeline run.
    Run,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutScope::Call => "call",
            TimeoutScope::Stage => "stage",
            TimeoutScope::Run => "run",
        })
    }
}

/// Why a stage handler failed.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// A tool call the stage depends on failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("{scope} timeout after {timeout_ms}ms")]
    Timeout { scope: TimeoutScope, timeout_ms: u64 },

    /// The input event's payload is unusable.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// A stage received or produced an event of the wrong kind.
    #[error("expected {expected} event, got {actual}")]
    UnexpectedEvent { expected: EventKind, actual: EventKind },

    /// An external content collaborator reported a failure.
    #[error("collaborator failed: {reason}")]
    Collaborator { reason: String },
}

/// A stage failure, naming the stage.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage}' failed: {cause}")]
pub struct StageFailure {
    pub stage: String,
    #[source]
    pub cause: StageError,
}

/// A failed pipeline run with the events emitted before the failure.
#[derive(Debug, Clone, Error)]
#[error("pipeline failed for document '{document_id}': {failure}")]
pub struct PipelineError {
    pub document_id: String,
    #[source]
    pub failure: StageFailure,
    /// Stage outputs appended before the failing stage, in order.
    pub history: Vec<Event>,
}

impl PipelineError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &str {
        &self.failure.stage
    }

    pub fn cause(&self) -> &StageError {
        &self.failure.cause
    }
}
