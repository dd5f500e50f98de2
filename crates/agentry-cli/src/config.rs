//! Runtime configuration loader.
//!
//! Resolves the config path (`--config`, then `AGENTRY_CONFIG`, then
//! `~/.agentry/config.toml`) and parses it into a validated
//! [`RuntimeConfig`]. A missing file means defaults. A file that exists but
//! cannot be read or parsed is an error: the runtime never starts on a
//! config it could not understand.

use std::path::{Path, PathBuf};

use agentry_types::config::RuntimeConfig;
use agentry_types::error::ConfigError;

/// Resolve the default data directory.
///
/// Priority:
/// 1. `AGENTRY_DATA_DIR` environment variable
/// 2. `~/.agentry`
/// 3. `.agentry` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENTRY_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".agentry");
    }

    PathBuf::from(".agentry")
}

/// Path of the config file to load.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => resolve_data_dir().join("config.toml"),
    }
}

/// Load and validate the runtime configuration at `path`.
///
/// - If the file does not exist, returns [`RuntimeConfig::default()`].
/// - If it cannot be read, returns [`ConfigError::Read`].
/// - If it fails to parse or validate, returns the parse/validation error.
pub async fn load_runtime_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return Ok(RuntimeConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config = RuntimeConfig::from_toml(&content)?;
    tracing::debug!(
        path = %path.display(),
        agents = config.agents.len(),
        "runtime config loaded"
    );
    Ok(config)
}
