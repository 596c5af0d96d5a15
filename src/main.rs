//! `docpipe-status [registry.json]`
//!
//! Connects every enabled tool server from the registry and prints the
//! per-server status snapshot as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use docpipe::config::{default_config_dir, load_settings_or_default};
use docpipe::tool_client::ProcessConnector;
use docpipe::{StatusFeed, ToolConnectionManager, ToolServerRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_file = docpipe::init_tracing(&docpipe::data_dir(), false)
        .context("failed to initialize logging")?;

    let cwd = std::env::current_dir().context("cannot read current directory")?;
    let settings = load_settings_or_default(&cwd)?;

    let registry_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| default_config_dir().join("tool-servers.json"));
    let registry = ToolServerRegistry::load(&registry_path)
        .with_context(|| format!("failed to load {}", registry_path.display()))?;
    let snapshot = registry.apply();
    tracing::info!(
        version = snapshot.version(),
        servers = ?snapshot.names(),
        "registry applied"
    );

    let manager = ToolConnectionManager::new(
        Arc::new(registry),
        Arc::new(ProcessConnector::new().with_working_dir(cwd.display().to_string())),
        settings,
        StatusFeed::default(),
    );

    let failures = manager.connect_all().await;
    for (server, error) in &failures {
        eprintln!("{server}: {error}");
    }

    let status = manager.status_snapshot();
    println!("{}", serde_json::to_string_pretty(&status)?);

    manager.shutdown_all().await;
    eprintln!("log: {}", log_file.display());
    Ok(())
}
