//! Configuration directory helpers for the mail blob store
//!
//! Configuration lives in `~/.config/mailstore/` unless the
//! `MAILSTORE_CONFIG_DIR` environment variable points somewhere else.
//! Blob data defaults to the platform data directory (`~/.local/share/mailstore`).
//!
//! Call [`init`] at process startup to bootstrap the config directory.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "MAILSTORE_CONFIG_DIR";

const APP_DIR: &str = "mailstore";

/// Initialize the config directory, creating it if needed.
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

/// Get the config directory
///
/// `MAILSTORE_CONFIG_DIR` wins over the platform default.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Default root for blob data (volumes, incoming, cache)
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Get the path to a file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Check if a config file exists in the config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Load and parse a JSON file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load a JSON file from the config directory, or `T::default()` when absent
pub fn load_json_or_default<T: DeserializeOwned + Default>(filename: &str) -> Result<T> {
    if config_exists(filename) {
        load_json(filename)
    } else {
        Ok(T::default())
    }
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Ensure the config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}

/// Save a value as pretty JSON to a file in the config directory
pub fn save_json<T: serde::Serialize>(filename: &str, value: &T) -> Result<PathBuf> {
    let dir = ensure_config_dir()?;
    let path = dir.join(filename);
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_joins_filename() {
        let path = config_path("blobstore.json").unwrap();
        assert!(path.ends_with("blobstore.json"));
    }

    #[test]
    fn test_data_dir() {
        let dir = data_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with("mailstore"));
    }

    #[test]
    fn test_missing_file_loads_default() {
        let name = format!("missing-{}.json", std::process::id());
        let value: Vec<String> = load_json_or_default(&name).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_load_json_file_reports_path() {
        let dir = std::env::temp_dir().join(format!("mailstore-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_json_file::<serde_json::Value>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
