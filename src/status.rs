//! Status feed for an external dashboard or log collaborator.
//!
//! Connection-state transitions (published by the connection manager) and
//! pipeline outcomes (published by the engine) go out on one broadcast
//! channel. Late subscribers miss earlier records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::tool_client::ConnectionState;

/// Records buffered per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed,
    Failed,
}

/// One structured status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusRecord {
    Connection {
        server: String,
        from: ConnectionState,
        to: ConnectionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Pipeline {
        document_id: String,
        outcome: PipelineOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_stage: Option<String>,
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
}

impl StatusRecord {
    pub fn connection(
        server: &str,
        from: ConnectionState,
        to: ConnectionState,
        reason: Option<String>,
    ) -> Self {
        StatusRecord::Connection {
            server: server.to_string(),
            from,
            to,
            reason,
            at: Utc::now(),
        }
    }
}

/// Broadcast channel of [`StatusRecord`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatusFeed {
    tx: broadcast::Sender<StatusRecord>,
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusRecord> {
        self.tx.subscribe()
    }

    /// Publish a record. Having no subscribers is fine.
    pub fn publish(&self, record: StatusRecord) {
        tracing::debug!(record = ?record, "status");
        let _ = self.tx.send(record);
    }
}
