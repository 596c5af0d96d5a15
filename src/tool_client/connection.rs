//! A single live connection to a tool server.
//!
//! Lifecycle: `Unconnected → Connecting → Ready → Degraded → Closed`.
//! Everything that changes lifecycle state is `pub(super)` and called only by
//! the connection manager; the proxy and status readers use the read side.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transport::Transport;
use super::types::{ToolCatalog, ToolServerConfig};

// ─── ConnectionState ─────────────────────────────────────────────────────────

/// Lifecycle state of a tool-server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Ready,
    /// Excluded from routing until a successful reconnect.
    Degraded,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ─── Request Ids ─────────────────────────────────────────────────────────────

/// Monotonic request id source scoped to one connection.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU64,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl RequestIds {
    /// Hand out the next id. Never repeats for the lifetime of `self`.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

// ─── ToolConnection ──────────────────────────────────────────────────────────

/// A connection with its transport, discovered catalog, and health counters.
pub struct ToolConnection {
    server: String,
    config: ToolServerConfig,
    fingerprint: String,
    transport: Arc<dyn Transport>,
    catalog: ToolCatalog,
    ids: RequestIds,
    state: RwLock<ConnectionState>,
    failures: AtomicU32,
    last_health: Mutex<Option<DateTime<Utc>>>,
    connected_at: DateTime<Utc>,
}

impl fmt::Debug for ToolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolConnection")
            .field("server", &self.server)
            .field("state", &self.state())
            .field("tools", &self.catalog.len())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl ToolConnection {
    /// Wrap a transport that finished discovery. Starts in `Connecting`.
    pub(super) fn new(
        config: ToolServerConfig,
        transport: Arc<dyn Transport>,
        catalog: ToolCatalog,
        ids: RequestIds,
    ) -> Self {
        Self {
            server: config.name.clone(),
            fingerprint: config.fingerprint(),
            config,
            transport,
            catalog,
            ids,
            state: RwLock::new(ConnectionState::Connecting),
            failures: AtomicU32::new(0),
            last_health: Mutex::new(None),
            connected_at: Utc::now(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// The config this connection was built from.
    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_health(&self) -> Option<DateTime<Utc>> {
        *self.last_health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Fresh request id for this connection.
    pub fn next_request_id(&self) -> u64 {
        self.ids.next_id()
    }

    // ─── Manager-only mutation ───────────────────────────────────────────

    /// Move to `to`, returning the previous state.
    pub(super) fn transition(&self, to: ConnectionState) -> ConnectionState {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, to)
    }

    /// Move to `to` only if currently in `from`. Returns whether it moved.
    pub(super) fn transition_if(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Count one more consecutive failure and return the new total.
    pub(super) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the failure streak and stamp the health timestamp.
    pub(super) fn record_healthy(&self) {
        self.failures.store(0, Ordering::SeqCst);
        *self.last_health.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
