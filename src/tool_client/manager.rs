//! Tool connection manager: the one owner of connection lifecycle state.
//!
//! Keeps at most one connection per enabled server. Connecting, discovery,
//! health probing, degradation, and reconnection all happen here; the
//! invocation proxy only reads connection handles and reports transport
//! failures back so this module decides what to do about them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::status::{StatusFeed, StatusRecord};

use super::connection::{ConnectionState, ToolConnection};
use super::errors::ToolError;
use super::lifecycle::{self, Connector};
use super::registry::ToolServerRegistry;
use super::types::ToolServerConfig;

type ConnectAttempt = Shared<BoxFuture<'static, Result<Arc<ToolConnection>, ToolError>>>;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Per-server view for dashboards and the status binary.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub enabled: bool,
    pub state: ConnectionState,
    pub failures: u32,
    pub last_health: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub tools: Vec<String>,
    /// Backoff was exhausted; only `refresh` brings the server back.
    pub unavailable: bool,
}

/// A discovered tool matching a capability query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolMatch {
    pub server: String,
    pub tool: String,
    pub description: String,
}

// ─── ToolConnectionManager ───────────────────────────────────────────────────

pub struct ToolConnectionManager {
    registry: Arc<ToolServerRegistry>,
    connector: Arc<dyn Connector>,
    settings: Settings,
    feed: StatusFeed,
    connections: RwLock<HashMap<String, Arc<ToolConnection>>>,
    /// In-flight establishment attempts, one per server.
    attempts: Mutex<HashMap<String, ConnectAttempt>>,
    /// Servers that exhausted their backoff, with the attempt count.
    unavailable: Mutex<HashMap<String, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ToolConnectionManager {
    pub fn new(
        registry: Arc<ToolServerRegistry>,
        connector: Arc<dyn Connector>,
        settings: Settings,
        feed: StatusFeed,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connector,
            settings,
            feed,
            connections: RwLock::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    /// Current connection handle for `server`, if any.
    pub fn connection(&self, server: &str) -> Option<Arc<ToolConnection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
    }

    fn all_connections(&self) -> Vec<Arc<ToolConnection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn set_state(&self, conn: &ToolConnection, to: ConnectionState, reason: Option<String>) {
        let from = conn.transition(to);
        if from != to {
            tracing::info!(server = conn.server(), %from, %to, "connection state changed");
            self.feed
                .publish(StatusRecord::connection(conn.server(), from, to, reason));
        }
    }

    // ─── Connecting ──────────────────────────────────────────────────────

    /// Return a live connection for `server`, establishing one if needed.
    ///
    /// Idempotent. Concurrent callers share a single establishment attempt.
    /// A connection built from a config the registry no longer has applied is
    /// retired and replaced. Degraded connections are returned as-is; routing
    /// decides what to do with them.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        server: &str,
    ) -> Result<Arc<ToolConnection>, ToolError> {
        let snapshot = self.registry.active();
        let config = snapshot
            .get(server)
            .cloned()
            .ok_or_else(|| ToolError::Configuration {
                reason: format!("server '{server}' is not in the applied registry"),
            })?;

        if !config.enabled {
            if let Some(conn) = self.connection(server) {
                self.retire(&conn, "server disabled");
            }
            return Err(ToolError::Configuration {
                reason: format!("server '{server}' is disabled"),
            });
        }

        if let Some(conn) = self.connection(server) {
            if conn.fingerprint() != config.fingerprint() {
                self.retire(&conn, "configuration changed");
            } else if conn.state() != ConnectionState::Closed {
                return Ok(conn);
            }
        }

        if let Some(&attempts) = lock(&self.unavailable).get(server) {
            return Err(ToolError::Unavailable {
                server: server.to_string(),
                attempts,
            });
        }

        self.attempt_for(config).await
    }

    /// Join the in-flight attempt for this server or start a new one.
    ///
    /// The attempt runs as its own task so it finishes even if every caller
    /// awaiting it goes away.
    fn attempt_for(self: &Arc<Self>, config: ToolServerConfig) -> ConnectAttempt {
        let mut attempts = lock(&self.attempts);
        if let Some(existing) = attempts.get(&config.name) {
            return existing.clone();
        }

        // Attempts publish their outcome under this lock, so a caller that
        // raced a finishing attempt sees its connection or its mark here.
        let settled = match self.connection(&config.name) {
            Some(conn)
                if conn.fingerprint() == config.fingerprint()
                    && conn.state() != ConnectionState::Closed =>
            {
                Some(Ok(conn))
            }
            _ => lock(&self.unavailable).get(&config.name).map(|&count| {
                Err(ToolError::Unavailable {
                    server: config.name.clone(),
                    attempts: count,
                })
            }),
        };
        if let Some(result) = settled {
            return futures::future::ready(result).boxed().shared();
        }

        let name = config.name.clone();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move { manager.connect_with_backoff(config).await });

        let server = name.clone();
        let attempt = async move {
            task.await.unwrap_or_else(|e| {
                Err(ToolError::Connection {
                    server,
                    reason: format!("connect task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared();

        attempts.insert(name, attempt.clone());
        attempt
    }

    async fn connect_with_backoff(
        self: Arc<Self>,
        config: ToolServerConfig,
    ) -> Result<Arc<ToolConnection>, ToolError> {
        let name = config.name.clone();
        let policy = config
            .backoff
            .clone()
            .unwrap_or_else(|| self.settings.backoff.clone());
        let from = self
            .connection(&name)
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Unconnected);
        self.feed.publish(StatusRecord::connection(
            &name,
            from,
            ConnectionState::Connecting,
            None,
        ));

        let discovery_timeout = self.settings.connection.discovery_timeout();
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                tracing::debug!(
                    server = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before connection attempt"
                );
                tokio::time::sleep(delay).await;
            }

            match lifecycle::establish(self.connector.as_ref(), &config, discovery_timeout).await {
                Ok(conn) => break Ok(conn),
                Err(e) => {
                    tracing::warn!(
                        server = %name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    if !policy.allows(attempt) {
                        break Err(e);
                    }
                }
            }
        };

        match result {
            Ok(conn) => {
                let conn = Arc::new(conn);
                conn.record_healthy();
                self.set_state(&conn, ConnectionState::Ready, None);
                let replaced = {
                    let mut attempts = lock(&self.attempts);
                    let replaced = self
                        .connections
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(name.clone(), Arc::clone(&conn));
                    lock(&self.unavailable).remove(&name);
                    attempts.remove(&name);
                    replaced
                };
                if let Some(old) = replaced.filter(|old| old.state() != ConnectionState::Closed) {
                    self.set_state(
                        &old,
                        ConnectionState::Closed,
                        Some("replaced by a new connection".into()),
                    );
                }
                tracing::info!(
                    server = %name,
                    tools = conn.catalog().len(),
                    attempts = attempt,
                    "tool server ready"
                );
                Ok(conn)
            }
            Err(last) => {
                {
                    let mut attempts = lock(&self.attempts);
                    lock(&self.unavailable).insert(name.clone(), attempt);
                    attempts.remove(&name);
                }
                let reason = match last {
                    ToolError::Connection { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::error!(
                    server = %name,
                    attempts = attempt,
                    error = %reason,
                    "tool server unavailable until refreshed"
                );
                self.feed.publish(StatusRecord::connection(
                    &name,
                    ConnectionState::Connecting,
                    ConnectionState::Closed,
                    Some(format!("unavailable after {attempt} attempts")),
                ));
                Err(ToolError::Connection {
                    server: name.clone(),
                    reason: format!("gave up after {attempt} attempts: {reason}"),
                })
            }
        }
    }

    /// Connect every enabled server concurrently.
    ///
    /// Retires connections the applied registry no longer backs first.
    /// Returns the servers that failed (partial startup is OK).
    pub async fn connect_all(self: &Arc<Self>) -> Vec<(String, ToolError)> {
        self.reconcile();
        let snapshot = self.registry.active();
        let names: Vec<String> = snapshot.enabled().map(|c| c.name.clone()).collect();

        let results = futures::future::join_all(names.iter().map(|name| async move {
            (name.clone(), self.ensure_connected(name).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    /// Retire every connection whose server is gone, disabled, or reconfigured
    /// in the applied registry.
    pub fn reconcile(&self) {
        let snapshot = self.registry.active();
        for conn in self.all_connections() {
            let reason = match snapshot.get(conn.server()) {
                None => Some("server removed"),
                Some(config) if !config.enabled => Some("server disabled"),
                Some(config) if config.fingerprint() != conn.fingerprint() => {
                    Some("configuration changed")
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                self.retire(&conn, reason);
            }
        }
    }

    /// Drop `conn` from routing and mark it Closed.
    ///
    /// Its transport stays open for calls already holding the handle and is
    /// released when the last of them finishes.
    fn retire(&self, conn: &Arc<ToolConnection>, reason: &str) {
        {
            let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
            match connections.get(conn.server()) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(conn.server());
                }
                _ => return,
            }
        }
        tracing::info!(server = conn.server(), reason, "retiring connection");
        self.set_state(conn, ConnectionState::Closed, Some(reason.to_string()));
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Probe `server` once and update its failure streak.
    ///
    /// Crossing the failure threshold moves a Ready connection to Degraded.
    /// Returns the connection's state after the probe.
    pub async fn health_check(&self, server: &str) -> Result<ConnectionState, ToolError> {
        let conn = self.connection(server).ok_or_else(|| ToolError::Connection {
            server: server.to_string(),
            reason: "not connected".into(),
        })?;
        if matches!(
            conn.state(),
            ConnectionState::Closed | ConnectionState::Unconnected
        ) {
            return Ok(conn.state());
        }

        let probe = async {
            if !conn.transport().is_alive() {
                return Err(ToolError::ConnectionLost {
                    server: server.to_string(),
                    reason: "transport closed".into(),
                });
            }
            conn.transport()
                .request(conn.next_request_id(), "ping", None)
                .await
        };

        let healthy = match tokio::time::timeout(self.settings.connection.probe_timeout(), probe).await
        {
            Ok(Ok(_)) => true,
            // The server answered, so it is alive even if it dislikes `ping`.
            Ok(Err(ToolError::ServerError { .. })) => true,
            Ok(Err(e)) => {
                tracing::debug!(server, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(server, "health probe timed out");
                false
            }
        };

        if healthy {
            conn.record_healthy();
            return Ok(conn.state());
        }

        let failures = conn.record_failure();
        let threshold = self.settings.connection.failure_threshold.max(1);
        tracing::warn!(server, failures, threshold, "health check failed");

        if failures >= threshold
            && conn.transition_if(ConnectionState::Ready, ConnectionState::Degraded)
        {
            tracing::warn!(server, failures, "connection degraded");
            self.feed.publish(StatusRecord::connection(
                server,
                ConnectionState::Ready,
                ConnectionState::Degraded,
                Some(format!("{failures} consecutive failures")),
            ));
        }
        Ok(conn.state())
    }

    /// Ask for a health re-evaluation without waiting for it.
    ///
    /// Used by the proxy after a transport failure.
    pub fn request_health_check(self: &Arc<Self>, server: &str) {
        let manager = Arc::clone(self);
        let server = server.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.health_check(&server).await {
                tracing::debug!(server = %server, error = %e, "requested health check skipped");
            }
        });
    }

    /// One monitoring pass: probe Ready connections, reconnect Degraded ones.
    pub async fn run_health_pass(self: &Arc<Self>) {
        for conn in self.all_connections() {
            match conn.state() {
                ConnectionState::Ready => {
                    let _ = self.health_check(conn.server()).await;
                }
                ConnectionState::Degraded => {
                    if let Err(e) = self.reconnect(conn.server()).await {
                        tracing::warn!(server = conn.server(), error = %e, "reconnect failed");
                    }
                }
                _ => {}
            }
        }
    }

    /// Run [`Self::run_health_pass`] every `interval` until the manager is
    /// dropped or the handle is aborted.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.run_health_pass().await;
            }
        })
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// A Ready connection for new work on `server`.
    ///
    /// Degraded connections are excluded until a successful reconnect.
    pub async fn acquire(self: &Arc<Self>, server: &str) -> Result<Arc<ToolConnection>, ToolError> {
        let conn = self.ensure_connected(server).await?;
        match conn.state() {
            ConnectionState::Ready => Ok(conn),
            ConnectionState::Degraded => Err(ToolError::Degraded {
                server: server.to_string(),
                failures: conn.failure_count(),
            }),
            state => Err(ToolError::Connection {
                server: server.to_string(),
                reason: format!("connection is {state}"),
            }),
        }
    }

    /// Tools on Ready connections whose name or description mentions
    /// `capability` (case-insensitive).
    pub fn find_tools(&self, capability: &str) -> Vec<ToolMatch> {
        let needle = capability.to_lowercase();
        let mut matches: Vec<ToolMatch> = self
            .all_connections()
            .iter()
            .filter(|conn| conn.is_ready())
            .flat_map(|conn| {
                conn.catalog()
                    .iter()
                    .filter(|(tool, entry)| {
                        tool.to_lowercase().contains(&needle)
                            || entry.description.to_lowercase().contains(&needle)
                    })
                    .map(|(tool, entry)| ToolMatch {
                        server: conn.server().to_string(),
                        tool: tool.clone(),
                        description: entry.description.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        matches.sort_by(|a, b| (&a.server, &a.tool).cmp(&(&b.server, &b.tool)));
        matches
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Release `server`'s transport and mark it Closed. No-op if not open.
    pub async fn disconnect(&self, server: &str) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server);
        let Some(conn) = removed else {
            return;
        };
        if conn.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(&conn, ConnectionState::Closed, Some("disconnected".into()));
        conn.transport().close().await;
    }

    /// Disconnect and establish a fresh connection (with backoff).
    pub async fn reconnect(self: &Arc<Self>, server: &str) -> Result<Arc<ToolConnection>, ToolError> {
        tracing::info!(server, "reconnecting");
        self.disconnect(server).await;
        self.ensure_connected(server).await
    }

    /// Clear a permanent-unavailable mark and reconnect.
    pub async fn refresh(self: &Arc<Self>, server: &str) -> Result<Arc<ToolConnection>, ToolError> {
        if lock(&self.unavailable).remove(server).is_some() {
            tracing::info!(server, "cleared unavailable mark");
        }
        self.reconnect(server).await
    }

    /// Close every connection.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<ToolConnection>> = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        let closing = drained.iter().map(|conn| async move {
            self.set_state(conn, ConnectionState::Closed, Some("shutdown".into()));
            conn.transport().close().await;
        });
        futures::future::join_all(closing).await;
        tracing::info!(count = drained.len(), "all tool servers shut down");
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn is_unavailable(&self, server: &str) -> bool {
        lock(&self.unavailable).contains_key(server)
    }

    /// Per-server view of every server in the applied registry.
    pub fn status_snapshot(&self) -> Vec<ServerStatus> {
        let snapshot = self.registry.active();
        let connecting: Vec<String> = lock(&self.attempts).keys().cloned().collect();

        snapshot
            .all()
            .map(|config| {
                let conn = self.connection(&config.name);
                let unavailable = self.is_unavailable(&config.name);
                let state = match &conn {
                    Some(conn) => conn.state(),
                    None if connecting.contains(&config.name) => ConnectionState::Connecting,
                    None if unavailable => ConnectionState::Closed,
                    None => ConnectionState::Unconnected,
                };
                ServerStatus {
                    name: config.name.clone(),
                    enabled: config.enabled,
                    state,
                    failures: conn.as_ref().map(|c| c.failure_count()).unwrap_or(0),
                    last_health: conn.as_ref().and_then(|c| c.last_health()),
                    tool_count: conn.as_ref().map(|c| c.catalog().len()).unwrap_or(0),
                    tools: conn
                        .as_ref()
                        .map(|c| {
                            c.catalog()
                                .tool_names()
                                .iter()
                                .map(|t| t.to_string())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default(),
                    unavailable,
                }
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_client::testing::{fast_settings, manager_for, ScriptedConnector, ScriptedServer};
    use serde_json::json;

    fn fs_server() -> ScriptedServer {
        ScriptedServer::new("fs").with_tool("read_file", json!({"type": "object"}))
    }

    #[tokio::test]
    async fn test_ensure_connected_discovers_catalog() {
        let fs = fs_server();
        let (manager, _) = manager_for(&[fs.clone()]);

        let conn = manager.ensure_connected("fs").await.unwrap();
        assert!(conn.is_ready());
        assert!(conn.catalog().contains("read_file"));
        assert_eq!(fs.seen_methods()[..2], ["initialize", "tools/list"]);
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let (manager, connector) = manager_for(&[fs_server()]);
        let a = manager.ensure_connected("fs").await.unwrap();
        let b = manager.ensure_connected("fs").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.attempts("fs"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let fs = fs_server().with_handshake_delay(Duration::from_millis(50));
        let (manager, connector) = manager_for(&[fs]);

        let results = futures::future::join_all((0..10).map(|_| manager.ensure_connected("fs"))).await;
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(connector.attempts("fs"), 1);
    }

    fn applied_config(manager: &ToolConnectionManager, server: &str) -> ToolServerConfig {
        manager.registry().active().get(server).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_late_caller_reuses_connection_published_by_finished_attempt() {
        let (manager, connector) = manager_for(&[fs_server()]);
        let conn = manager.ensure_connected("fs").await.unwrap();
        let mut rx = manager.feed().subscribe();

        // A caller that checked before the connection was published and
        // reaches the attempt table after the attempt removed itself.
        let late = manager.attempt_for(applied_config(&manager, "fs")).await.unwrap();

        assert!(Arc::ptr_eq(&conn, &late));
        assert!(conn.is_ready());
        assert_eq!(connector.attempts("fs"), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_sees_unavailable_mark() {
        let (manager, connector) = manager_for(&[ScriptedServer::new("ghost").unreachable()]);
        let max_attempts = manager.settings().backoff.max_attempts;
        assert!(manager.ensure_connected("ghost").await.is_err());

        let err = manager
            .attempt_for(applied_config(&manager, "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unavailable { attempts, .. } if attempts == max_attempts));
        assert_eq!(connector.attempts("ghost"), max_attempts);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_callers_never_replace_a_live_connection() {
        for _ in 0..25 {
            let (manager, connector) = manager_for(&[fs_server()]);
            let callers: Vec<_> = (0..64)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move { manager.ensure_connected("fs").await })
                })
                .collect();

            let mut conns = Vec::new();
            for caller in callers {
                conns.push(caller.await.unwrap().unwrap());
            }
            let current = manager.connection("fs").unwrap();
            assert!(conns.iter().all(|c| Arc::ptr_eq(c, &current)));
            assert!(current.is_ready());
            assert_eq!(connector.attempts("fs"), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_exhausts_backoff() {
        let ghost = ScriptedServer::new("ghost").unreachable();
        let (manager, connector) = manager_for(&[ghost]);
        let max_attempts = manager.settings().backoff.max_attempts;

        let err = manager.ensure_connected("ghost").await.unwrap_err();
        assert!(matches!(err, ToolError::Connection { ref server, .. } if server == "ghost"));
        assert_eq!(connector.attempts("ghost"), max_attempts);
        assert!(manager.is_unavailable("ghost"));

        // Permanently unavailable: no new attempts until refreshed.
        let err = manager.ensure_connected("ghost").await.unwrap_err();
        assert!(matches!(err, ToolError::Unavailable { attempts, .. } if attempts == max_attempts));
        assert_eq!(connector.attempts("ghost"), max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_clears_unavailable() {
        let ghost = ScriptedServer::new("ghost").unreachable();
        let (manager, _) = manager_for(&[ghost.clone()]);
        assert!(manager.ensure_connected("ghost").await.is_err());

        ghost.set_unreachable(false);
        let conn = manager.refresh("ghost").await.unwrap();
        assert!(conn.is_ready());
        assert!(!manager.is_unavailable("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_backoff_budget() {
        let flaky = ScriptedServer::new("flaky").failing_connects(2);
        let (manager, connector) = manager_for(&[flaky]);

        let conn = manager.ensure_connected("flaky").await.unwrap();
        assert!(conn.is_ready());
        assert_eq!(connector.attempts("flaky"), 3);
    }

    #[tokio::test]
    async fn test_failure_threshold_degrades_connection() {
        let fs = fs_server();
        let (manager, _) = manager_for(&[fs.clone()]);
        let mut rx = manager.feed().subscribe();
        manager.ensure_connected("fs").await.unwrap();

        fs.set_ping_failing(true);
        let threshold = manager.settings().connection.failure_threshold;
        for i in 1..threshold {
            assert_eq!(manager.health_check("fs").await.unwrap(), ConnectionState::Ready);
            assert_eq!(manager.connection("fs").unwrap().failure_count(), i);
        }
        assert_eq!(manager.health_check("fs").await.unwrap(), ConnectionState::Degraded);

        let err = manager.acquire("fs").await.unwrap_err();
        assert!(matches!(err, ToolError::Degraded { failures, .. } if failures == threshold));

        let mut saw_degraded = false;
        while let Ok(record) = rx.try_recv() {
            if let StatusRecord::Connection { to: ConnectionState::Degraded, .. } = record {
                saw_degraded = true;
            }
        }
        assert!(saw_degraded);

        // A successful reconnect restores routing.
        fs.set_ping_failing(false);
        manager.reconnect("fs").await.unwrap();
        assert!(manager.acquire("fs").await.is_ok());
    }

    #[tokio::test]
    async fn test_healthy_probe_resets_streak() {
        let fs = fs_server();
        let (manager, _) = manager_for(&[fs.clone()]);
        manager.ensure_connected("fs").await.unwrap();

        fs.set_ping_failing(true);
        manager.health_check("fs").await.unwrap();
        fs.set_ping_failing(false);
        manager.health_check("fs").await.unwrap();

        let conn = manager.connection("fs").unwrap();
        assert_eq!(conn.failure_count(), 0);
        assert!(conn.last_health().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_closes_and_is_idempotent() {
        let fs = fs_server();
        let (manager, _) = manager_for(&[fs.clone()]);
        let conn = manager.ensure_connected("fs").await.unwrap();

        manager.disconnect("fs").await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(fs.was_closed());
        assert!(manager.connection("fs").is_none());

        manager.disconnect("fs").await;
    }

    #[tokio::test]
    async fn test_config_change_reconciles_on_next_ensure() {
        let (manager, connector) = manager_for(&[fs_server()]);
        let old = manager.ensure_connected("fs").await.unwrap();

        let mut changed = manager.registry().list().remove(0);
        changed.call_timeout_ms = 1234;
        manager.registry().update(changed).unwrap();

        // Not applied yet: the open connection is untouched.
        let same = manager.ensure_connected("fs").await.unwrap();
        assert!(Arc::ptr_eq(&old, &same));

        manager.registry().apply();
        let fresh = manager.ensure_connected("fs").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(old.state(), ConnectionState::Closed);
        assert_eq!(fresh.config().call_timeout_ms, 1234);
        assert_eq!(connector.attempts("fs"), 2);
    }

    #[tokio::test]
    async fn test_disabled_server_is_rejected() {
        let (manager, _) = manager_for(&[fs_server()]);
        manager.ensure_connected("fs").await.unwrap();

        manager.registry().disable("fs").unwrap();
        manager.registry().apply();
        let err = manager.ensure_connected("fs").await.unwrap_err();
        assert!(matches!(err, ToolError::Configuration { .. }));
        assert!(manager.connection("fs").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_reports_partial_failures() {
        let (manager, _) = manager_for(&[fs_server(), ScriptedServer::new("ghost").unreachable()]);
        let failures = manager.connect_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "ghost");

        let status = manager.status_snapshot();
        let fs = status.iter().find(|s| s.name == "fs").unwrap();
        assert_eq!(fs.state, ConnectionState::Ready);
        assert_eq!(fs.tools, vec!["read_file"]);
        let ghost = status.iter().find(|s| s.name == "ghost").unwrap();
        assert!(ghost.unavailable);
        assert_eq!(ghost.state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_find_tools_matches_name_and_description() {
        let memory = ScriptedServer::new("memory")
            .with_described_tool("create_entities", "Create entities in the knowledge graph")
            .with_described_tool("search_nodes", "Search the graph");
        let (manager, _) = manager_for(&[fs_server(), memory]);
        manager.connect_all().await;

        let found = manager.find_tools("GRAPH");
        let names: Vec<&str> = found.iter().map(|m| m.tool.as_str()).collect();
        assert_eq!(names, vec!["create_entities", "search_nodes"]);
        assert_eq!(manager.find_tools("read").len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_everything() {
        let fs = fs_server();
        let (manager, _) = manager_for(&[fs.clone()]);
        let conn = manager.ensure_connected("fs").await.unwrap();

        manager.shutdown_all().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(fs.was_closed());
        assert!(manager.status_snapshot()[0].state == ConnectionState::Unconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_reconnects_degraded() {
        let fs = fs_server();
        let (manager, connector) = manager_for(&[fs.clone()]);
        manager.ensure_connected("fs").await.unwrap();

        fs.set_ping_failing(true);
        let threshold = manager.settings().connection.failure_threshold;
        for _ in 0..threshold {
            manager.health_check("fs").await.unwrap();
        }
        fs.set_ping_failing(false);

        let monitor = manager.spawn_health_monitor(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        monitor.abort();

        assert_eq!(connector.attempts("fs"), 2);
        assert!(manager.acquire("fs").await.is_ok());
    }

    #[test]
    fn test_fast_settings_are_small() {
        let settings = fast_settings();
        assert_eq!(settings.connection.failure_threshold, 3);
        assert!(settings.backoff.max_delay_ms <= 1000);
    }

    #[tokio::test]
    async fn test_unknown_server_is_configuration_error() {
        let registry = Arc::new(ToolServerRegistry::new());
        let manager = ToolConnectionManager::new(
            registry,
            Arc::new(ScriptedConnector::new()),
            fast_settings(),
            StatusFeed::default(),
        );
        assert!(matches!(
            manager.ensure_connected("nope").await,
            Err(ToolError::Configuration { .. })
        ));
    }
}
