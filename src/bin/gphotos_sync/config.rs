//! Configuration file support for the gphotos-sync CLI.
//!
//! Provides persistent configuration storage in OS-native locations:
//! - macOS: ~/Library/Application Support/gphotos-sync/config.toml
//! - Linux: ~/.config/gphotos-sync/config.toml
//! - Windows: C:\Users\<user>\AppData\Roaming\gphotos-sync\config.toml

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// OAuth access token for the Google Photos Library API.
    pub access_token: Option<String>,
}

/// Returns the path to the configuration file.
///
/// Uses OS-native configuration directories via the `directories` crate.
/// Falls back to `~/.config/gphotos-sync/config.toml` if ProjectDirs fails.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("", "", "gphotos-sync") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".config")
            .join("gphotos-sync")
            .join("config.toml")
    }
}

/// Loads configuration from the config file.
///
/// Returns `Config::default()` if the file doesn't exist or parsing fails.
/// This allows the application to work without a config file.
pub fn load() -> Config {
    load_inner().unwrap_or_default()
}

/// Internal load function that returns errors for debugging.
fn load_inner() -> Result<Config> {
    let path = config_path();

    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Persists configuration, replacing the current file.
///
/// Backs `--save-token`. The document goes to a sibling temp file that
/// is synced and renamed into place, so a concurrent reader never sees
/// a half-written config.
pub fn save(config: &Config) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let content = toml::to_string_pretty(config).context("serialising config")?;
    let temp_path = path.with_extension("toml.tmp");

    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("creating {}", temp_path.display()))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.sync_all())
        .with_context(|| format!("writing {}", temp_path.display()))?;

    fs::rename(&temp_path, &path)
        .with_context(|| format!("moving config into place at {}", path.display()))?;
    Ok(())
}
