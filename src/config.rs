//! Configuration loading and schema definitions for shardline.
//!
//! This module provides types and functions for loading shardline
//! configuration from TOML files or strings. The schema covers the run
//! options, the suite source, the execution collaborator, fixtures and
//! reporting.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A run option outside its allowed range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("shard_count must be at least 1 (got {0})")]
    InvalidShardCount(usize),

    #[error("workers_per_shard must be at least 1 (got {0})")]
    InvalidWorkerCount(usize),

    #[error("attempt_timeout_ms must be greater than 0")]
    InvalidAttemptTimeout,
}

/// Loads shardline configuration from a TOML file.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax or unknown run options
/// - A run option is out of range
///
/// # Example
///
/// ```no_run
/// use shardline::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("shardline.toml"))?;
/// println!("Shards: {}", config.run.shard_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .run
        .validate()
        .with_context(|| format!("Invalid run options in {}", path.display()))?;

    Ok(config)
}

/// Loads shardline configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardline::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     workers_per_shard = 4
///     retryBudget = 2
///
///     [executor]
///     type = "command"
///     command = "npx playwright test {file}"
/// "#)?;
///
/// assert_eq!(config.run.workers_per_shard, 4);
/// assert_eq!(config.run.retry_budget, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.run.validate().context("Invalid run options")?;

    Ok(config)
}

/// Expands `~` and environment variables in a configured path.
///
/// Paths that reference undefined variables are returned unchanged.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(e) => {
            tracing::debug!("Leaving path {} unexpanded: {}", raw, e);
            PathBuf::from(shellexpand::tilde(&raw).into_owned())
        }
    }
}
