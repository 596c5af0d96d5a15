//! Orchestrator settings loading and validation.
//!
//! Reads `docpipe.yaml` and resolves environment variables. Settings hold the
//! connection policy, reconnect backoff, and pipeline timeout scopes. Every
//! field has a default so a missing or partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tool_client::backoff::BackoffPolicy;

/// File name searched for by [`find_settings_path`].
pub const SETTINGS_FILE_NAME: &str = "docpipe.yaml";

/// Environment variable that overrides the settings directory.
pub const CONFIG_DIR_ENV: &str = "DOCPIPE_CONFIG_DIR";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while loading configuration or assembling a pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// A configuration file could not be parsed.
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    /// A configuration file could not be written.
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    /// No settings file was found.
    #[error("settings not found: {reason}")]
    NotFound { reason: String },

    /// A pipeline was assembled from stages that do not chain.
    #[error("invalid pipeline: {reason}")]
    InvalidPipeline { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Connection health policy shared by every tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    /// Consecutive failures before a connection is marked degraded.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Interval between background health probes.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Timeout for a single liveness probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Timeout for the initialize + catalog handshake.
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_discovery_timeout_ms() -> u64 {
    30_000
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            health_interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

impl ConnectionPolicy {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Timeout scopes applied by the pipeline engine.
///
/// Per-call timeouts live on each tool server's config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTimeouts {
    /// Bounds one stage, including every tool call it makes.
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Bounds a whole pipeline run.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}
fn default_run_timeout_ms() -> u64 {
    600_000
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            stage_timeout_ms: default_stage_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
        }
    }
}

impl PipelineTimeouts {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

/// Top-level settings (mirrors `docpipe.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionPolicy,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub pipeline: PipelineTimeouts,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Platform config directory for docpipe (`~/.config/docpipe` on Linux).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docpipe")
}

/// Locate `docpipe.yaml`.
///
/// Checks `DOCPIPE_CONFIG_DIR` first, then walks upward from `start`, then
/// falls back to the platform config directory.
pub fn find_settings_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        let candidate = PathBuf::from(&dir).join(SETTINGS_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(SETTINGS_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    let candidate = default_config_dir().join(SETTINGS_FILE_NAME);
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(ConfigError::NotFound {
        reason: format!("could not find {SETTINGS_FILE_NAME}"),
    })
}

/// Load and parse a settings file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Load settings if a file can be found, otherwise use defaults.
pub fn load_settings_or_default(start: &Path) -> Result<Settings, ConfigError> {
    match find_settings_path(start) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading settings");
            load_settings(&path)
        }
        Err(ConfigError::NotFound { .. }) => {
            tracing::debug!("no settings file found, using defaults");
            Ok(Settings::default())
        }
        Err(e) => Err(e),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
