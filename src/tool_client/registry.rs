//! Tool server registry: a versioned, explicitly applied set of server configs.
//!
//! Edits (add/remove/enable/disable/update) change a draft and bump its
//! version. Nothing reaches the connection manager until [`ToolServerRegistry::apply`]
//! publishes the draft as an immutable [`RegistrySnapshot`]; the manager
//! compares snapshots against the configs its open connections were built
//! from and reconciles on the next `ensure_connected`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::{interpolate_env_vars, ConfigError};

use super::errors::ToolError;
use super::types::{GlobalSettings, ServerEntry, ToolServerConfig, ToolServersFile};

// ─── RegistrySnapshot ────────────────────────────────────────────────────────

/// An applied, immutable view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    servers: BTreeMap<String, ToolServerConfig>,
}

impl RegistrySnapshot {
    /// Draft version this snapshot was applied from (0 = nothing applied yet).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&ToolServerConfig> {
        self.servers.get(name)
    }

    /// Enabled servers, in name order.
    pub fn enabled(&self) -> impl Iterator<Item = &ToolServerConfig> {
        self.servers.values().filter(|c| c.enabled)
    }

    pub fn all(&self) -> impl Iterator<Item = &ToolServerConfig> {
        self.servers.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.servers.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// ─── ToolServerRegistry ──────────────────────────────────────────────────────

struct RegistryState {
    draft: BTreeMap<String, ToolServerConfig>,
    globals: GlobalSettings,
    version: u64,
    applied: Arc<RegistrySnapshot>,
}

/// Holds configuration for every known tool server.
pub struct ToolServerRegistry {
    state: Mutex<RegistryState>,
}

impl Default for ToolServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolServerRegistry {
    /// An empty registry with nothing applied.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                draft: BTreeMap::new(),
                globals: GlobalSettings::default(),
                version: 0,
                applied: Arc::new(RegistrySnapshot::default()),
            }),
        }
    }

    /// A registry seeded with the built-in default servers (not yet applied).
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        {
            let mut state = registry.lock();
            for config in default_servers() {
                state.draft.insert(config.name.clone(), config);
            }
            state.version = 1;
        }
        registry
    }

    /// A registry holding `configs` (not yet applied). Rejects duplicates.
    pub fn from_configs(configs: Vec<ToolServerConfig>) -> Result<Self, ToolError> {
        let registry = Self::new();
        for config in configs {
            registry.add(config)?;
        }
        Ok(registry)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Edits ───────────────────────────────────────────────────────────

    /// Add a server config. Returns the new draft version.
    pub fn add(&self, config: ToolServerConfig) -> Result<u64, ToolError> {
        validate(&config)?;
        let mut state = self.lock();
        if state.draft.contains_key(&config.name) {
            return Err(ToolError::Configuration {
                reason: format!("duplicate server name '{}'", config.name),
            });
        }
        tracing::debug!(server = %config.name, enabled = config.enabled, "registry: added server");
        state.draft.insert(config.name.clone(), config);
        state.version += 1;
        Ok(state.version)
    }

    /// Replace an existing server config. Returns the new draft version.
    pub fn update(&self, config: ToolServerConfig) -> Result<u64, ToolError> {
        validate(&config)?;
        let mut state = self.lock();
        let slot = state
            .draft
            .get_mut(&config.name)
            .ok_or_else(|| unknown_server(&config.name))?;
        *slot = config;
        state.version += 1;
        Ok(state.version)
    }

    /// Remove a server config, returning it.
    pub fn remove(&self, name: &str) -> Result<ToolServerConfig, ToolError> {
        let mut state = self.lock();
        let removed = state.draft.remove(name).ok_or_else(|| unknown_server(name))?;
        state.version += 1;
        tracing::debug!(server = name, "registry: removed server");
        Ok(removed)
    }

    pub fn enable(&self, name: &str) -> Result<u64, ToolError> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<u64, ToolError> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<u64, ToolError> {
        let mut state = self.lock();
        let config = state.draft.get_mut(name).ok_or_else(|| unknown_server(name))?;
        if config.enabled == enabled {
            return Ok(state.version);
        }
        config.enabled = enabled;
        state.version += 1;
        tracing::debug!(server = name, enabled, "registry: toggled server");
        Ok(state.version)
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// Draft configs, in name order.
    pub fn list(&self) -> Vec<ToolServerConfig> {
        self.lock().draft.values().cloned().collect()
    }

    /// Current draft version.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Whether the draft has edits that have not been applied.
    pub fn has_pending_changes(&self) -> bool {
        let state = self.lock();
        state.version != state.applied.version
    }

    /// The applied snapshot the connection manager works from.
    pub fn active(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.lock().applied)
    }

    pub fn global_settings(&self) -> GlobalSettings {
        self.lock().globals.clone()
    }

    /// Publish the draft. Open connections are reconciled lazily.
    pub fn apply(&self) -> Arc<RegistrySnapshot> {
        let mut state = self.lock();
        if state.applied.version != state.version {
            state.applied = Arc::new(RegistrySnapshot {
                version: state.version,
                servers: state.draft.clone(),
            });
            tracing::info!(
                version = state.version,
                servers = state.draft.len(),
                "registry applied"
            );
        }
        Arc::clone(&state.applied)
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Load a registry file, merging its entries over the built-in defaults.
    ///
    /// A missing file yields the defaults. The result is not yet applied.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let registry = Self::with_defaults();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no registry file, using default servers");
            return Ok(registry);
        }

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let file: ToolServersFile =
            serde_json::from_str(&interpolate_env_vars(&raw)).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        {
            let mut state = registry.lock();
            let mut from_file = BTreeMap::new();
            for (key, entry) in file.servers {
                let config = entry.into_config(&key, &file.global_settings);
                if from_file.insert(config.name.clone(), config).is_some() {
                    return Err(ConfigError::Parse {
                        path: path.display().to_string(),
                        reason: format!("duplicate server name under key '{key}'"),
                    });
                }
            }
            state.draft.extend(from_file);
            state.globals = file.global_settings;
            state.version += 1;
        }

        tracing::info!(
            path = %path.display(),
            servers = registry.lock().draft.len(),
            "loaded tool server registry"
        );
        Ok(registry)
    }

    /// Write the draft as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = {
            let state = self.lock();
            ToolServersFile {
                servers: state
                    .draft
                    .iter()
                    .map(|(name, config)| (name.clone(), ServerEntry::from_config(config)))
                    .collect(),
                global_settings: state.globals.clone(),
            }
        };

        let json = serde_json::to_string_pretty(&file).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        std::fs::write(path, json).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "saved tool server registry");
        Ok(())
    }
}

fn validate(config: &ToolServerConfig) -> Result<(), ToolError> {
    if config.name.trim().is_empty() {
        return Err(ToolError::Configuration {
            reason: "server name must not be empty".into(),
        });
    }
    if config.connect.command.trim().is_empty() {
        return Err(ToolError::Configuration {
            reason: format!("server '{}' has no command", config.name),
        });
    }
    if config.call_timeout_ms == 0 {
        return Err(ToolError::Configuration {
            reason: format!("server '{}' has a zero call timeout", config.name),
        });
    }
    Ok(())
}

fn unknown_server(name: &str) -> ToolError {
    ToolError::Configuration {
        reason: format!("unknown server '{name}'"),
    }
}

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Built-in servers: filesystem and memory enabled, postgres disabled.
pub fn default_servers() -> Vec<ToolServerConfig> {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());

    let mut filesystem = ToolServerConfig::new(
        "filesystem",
        "npx",
        &["-y", "@modelcontextprotocol/server-filesystem", &cwd],
    )
    .enabled()
    .with_capabilities(&["read_file", "write_file", "list_directory", "search_files"]);
    filesystem.description = "File system operations and management".into();

    let mut memory = ToolServerConfig::new("memory", "npx", &["-y", "@modelcontextprotocol/server-memory"])
        .enabled()
        .with_capabilities(&["create_entities", "create_relations", "search_nodes"]);
    memory.description = "Knowledge graph and memory management".into();

    let database_url =
        interpolate_env_vars("${DATABASE_URL:-postgresql://localhost:5432/docpipe}");
    let mut postgres = ToolServerConfig::new(
        "postgres",
        "npx",
        &["-y", "enhanced-postgres-mcp-server", &database_url],
    )
    .with_capabilities(&["query", "insert", "update", "delete"]);
    postgres.description = "PostgreSQL database operations".into();

    vec![filesystem, memory, postgres]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
