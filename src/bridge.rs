//! Drives pipeline runs from a synchronous, re-entrant call site.
//!
//! A host that re-executes its calling code on every interaction cannot hold
//! a future across re-entries. The bridge keeps one slot per request key:
//!
//! ```text
//! Idle ─► Running ─► Completed | Failed | Cancelled | Crashed ─► (read once) ─► Idle
//! ```
//!
//! Re-entering with a Running key never starts a second run. A run whose
//! caller went away still finishes and parks its outcome in the slot until
//! the next re-entry picks it up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::pipeline::{Event, PipelineEngine, PipelineError, Received};

/// What a re-entry into the bridge observes.
#[derive(Debug, Clone)]
pub enum BridgeOutcome {
    Completed(Event),
    Failed(PipelineError),
    /// The run is in flight. Render as progress; do not resubmit.
    StillRunning,
    Cancelled,
    /// The run panicked.
    Crashed { reason: String },
}

/// Non-consuming view of a request key's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
    Crashed,
}

/// How a run ended, parked until the next re-entry reads it.
#[derive(Debug)]
enum Settled {
    Completed(Event),
    Failed(PipelineError),
    Cancelled,
    Crashed { reason: String },
}

impl Settled {
    fn state(&self) -> BridgeState {
        match self {
            Settled::Completed(_) => BridgeState::Completed,
            Settled::Failed(_) => BridgeState::Failed,
            Settled::Cancelled => BridgeState::Cancelled,
            Settled::Crashed { .. } => BridgeState::Crashed,
        }
    }
}

impl From<Settled> for BridgeOutcome {
    fn from(settled: Settled) -> Self {
        match settled {
            Settled::Completed(event) => BridgeOutcome::Completed(event),
            Settled::Failed(err) => BridgeOutcome::Failed(err),
            Settled::Cancelled => BridgeOutcome::Cancelled,
            Settled::Crashed { reason } => BridgeOutcome::Crashed { reason },
        }
    }
}

enum Slot {
    Running {
        generation: u64,
        abort: AbortHandle,
        done: watch::Receiver<bool>,
    },
    Settled(Settled),
}

impl Slot {
    fn state(&self) -> BridgeState {
        match self {
            Slot::Running { .. } => BridgeState::Running,
            Slot::Settled(settled) => settled.state(),
        }
    }
}

type SlotTable = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(table: &SlotTable) -> MutexGuard<'_, HashMap<String, Slot>> {
    // A panic while holding the lock leaves the map itself consistent.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Request-key table over a tokio runtime.
pub struct AsyncTaskBridge {
    runtime: Handle,
    slots: SlotTable,
    generations: AtomicU64,
}

impl AsyncTaskBridge {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            slots: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(1),
        }
    }

    /// A bridge on the runtime the caller is running in, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Start or attach to the run for `key`, never blocking.
    ///
    /// `invoke` is only called when the key is Idle. A settled outcome is
    /// handed out exactly once; the key is Idle again afterwards.
    pub fn run_to_completion<F, Fut>(&self, key: &str, invoke: F) -> BridgeOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Event, PipelineError>> + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        if matches!(slots.get(key), Some(Slot::Running { .. })) {
            tracing::debug!(request_key = key, "re-entry while running");
            return BridgeOutcome::StillRunning;
        }
        if let Some(Slot::Settled(settled)) = slots.remove(key) {
            tracing::debug!(request_key = key, "settled outcome handed out");
            return settled.into();
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let work = self.runtime.spawn(invoke());
        let abort = work.abort_handle();
        let (done_tx, done_rx) = watch::channel(false);

        let table = Arc::clone(&self.slots);
        let owned_key = key.to_string();
        self.runtime.spawn(async move {
            let outcome = match work.await {
                Ok(Ok(event)) => Settled::Completed(event),
                Ok(Err(err)) => Settled::Failed(err),
                Err(e) if e.is_cancelled() => Settled::Cancelled,
                Err(e) => Settled::Crashed {
                    reason: e.to_string(),
                },
            };
            settle(&table, &owned_key, generation, outcome);
            let _ = done_tx.send(true);
        });

        slots.insert(
            key.to_string(),
            Slot::Running {
                generation,
                abort,
                done: done_rx,
            },
        );
        tracing::info!(request_key = key, generation, "pipeline run started");
        BridgeOutcome::StillRunning
    }

    /// Run `engine` on `input` under `key`.
    pub fn run_pipeline(
        &self,
        key: &str,
        engine: Arc<PipelineEngine>,
        input: Received,
    ) -> BridgeOutcome {
        self.run_to_completion(key, move || async move { engine.run(input).await })
    }

    /// Abort the run for `key`. Returns false if nothing was running.
    ///
    /// The next re-entry sees [`BridgeOutcome::Cancelled`] once.
    pub fn cancel(&self, key: &str) -> bool {
        let mut slots = lock(&self.slots);
        let Some(Slot::Running { abort, .. }) = slots.get(key) else {
            return false;
        };
        abort.abort();
        slots.insert(key.to_string(), Slot::Settled(Settled::Cancelled));
        tracing::info!(request_key = key, "pipeline run cancelled");
        true
    }

    pub fn status(&self, key: &str) -> BridgeState {
        lock(&self.slots)
            .get(key)
            .map(Slot::state)
            .unwrap_or(BridgeState::Idle)
    }

    /// Wait up to `timeout` for a Running key to settle, without consuming
    /// its outcome.
    pub async fn wait(&self, key: &str, timeout: Duration) -> BridgeState {
        let done = match lock(&self.slots).get(key) {
            Some(Slot::Running { done, .. }) => done.clone(),
            Some(slot) => return slot.state(),
            None => return BridgeState::Idle,
        };
        let mut done = done;
        let _ = tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await;
        self.status(key)
    }

    /// Keys with a live or unread slot.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.slots).keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Park `outcome` unless the slot was cancelled or reused meanwhile.
fn settle(table: &SlotTable, key: &str, generation: u64, outcome: Settled) {
    let mut slots = lock(table);
    let current = matches!(
        slots.get(key),
        Some(Slot::Running { generation: g, .. }) if *g == generation
    );
    if !current {
        return;
    }
    match &outcome {
        Settled::Failed(err) => tracing::warn!(
            request_key = key,
            stage = err.stage(),
            error = %err,
            "pipeline run failed"
        ),
        Settled::Crashed { reason } => {
            tracing::error!(request_key = key, reason = %reason, "pipeline run crashed")
        }
        _ => tracing::info!(request_key = key, "pipeline run settled"),
    }
    slots.insert(key.to_string(), Slot::Settled(outcome));
}

// ─── Tests ───────────────────────────────────────────────────────────────────
