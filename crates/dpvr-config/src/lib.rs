mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Returns the config directory, e.g. ~/.config/dpvr/
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("dpvr");
    Ok(dir)
}

/// Returns the config file path: <config dir>/dpvr/config.toml
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Load config from the default location, or return defaults if there is none.
pub fn load_config() -> Result<AppConfig> {
    let path = config_path()?;
    if path.exists() {
        load_config_from(&path)
    } else {
        info!("No config found, using defaults");
        Ok(AppConfig::default())
    }
}

/// Load config from an explicit file. Missing keys take their defaults.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: AppConfig =
        toml::from_str(&contents).with_context(|| format!("Invalid config {}", path.display()))?;
    info!(?path, "Loaded config");
    Ok(config)
}
