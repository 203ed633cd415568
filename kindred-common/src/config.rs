//! Configuration loading and data folder resolution
//!
//! Missing configuration never stops startup: a missing TOML file logs a
//! warning and yields defaults. A file that exists but does not parse is an
//! error, since silently ignoring it would hide operator mistakes.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the data folder
pub const DATA_FOLDER_ENV: &str = "KINDRED_DATA_FOLDER";

/// Database file name inside the data folder
pub const DATABASE_FILE: &str = "kindred.db";

/// Logging section shared by every Kindred binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Data folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config file value
/// 4. OS-dependent compiled default
pub fn resolve_data_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    config_value: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = config_value {
        return path.to_path_buf();
    }

    default_data_folder()
}

/// Get OS-dependent default data folder path
pub fn default_data_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/kindred (or /var/lib/kindred for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("kindred"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/kindred"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("kindred"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/kindred"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("kindred"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\kindred"))
    } else {
        PathBuf::from("./kindred_data")
    }
}

/// Locate the configuration file
///
/// An explicit path wins even if it does not exist (loading then degrades to
/// defaults with a warning). Otherwise `~/.config/kindred/config.toml`, then
/// `/etc/kindred/config.toml`.
pub fn locate_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let user_config = dirs::config_dir().map(|d| d.join("kindred").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/kindred/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Load a TOML config file, falling back to defaults when it is absent
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file found, using compiled defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!("Config file {} not found, using compiled defaults", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write a config struct as TOML, creating parent directories
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
