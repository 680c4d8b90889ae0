//! Shared setup: configuration, request files, and the job registry.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use stratlab_core::{AppConfig, ConfigLoader, SweepRequest};
use stratlab_data::SqliteResultStore;
use stratlab_orchestrator::JobRegistry;
use stratlab_runner::SubprocessRunner;

pub fn load_config(profile: Option<&str>) -> Result<AppConfig> {
    match profile {
        Some(profile) => ConfigLoader::load_with_profile(profile),
        None => ConfigLoader::load(),
    }
}

/// Reads a JSON [`SweepRequest`] from `path`.
pub fn load_request(path: &Path) -> Result<SweepRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read request file {}", path.display()))?;
    parse_request(&text).with_context(|| format!("invalid request file {}", path.display()))
}

fn parse_request(text: &str) -> Result<SweepRequest> {
    Ok(serde_json::from_str(text)?)
}

/// Registry backed by the configured `SQLite` store and subprocess runner.
pub async fn open_registry(config: AppConfig) -> Result<JobRegistry> {
    let store = SqliteResultStore::connect(&config.database).await?;
    let runner = SubprocessRunner::new(config.runner);
    Ok(JobRegistry::new(
        config.engine,
        Arc::new(runner),
        Arc::new(store),
    ))
}
