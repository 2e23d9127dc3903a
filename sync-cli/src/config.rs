//! Configuration and data directory resolution for hearth-sync.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use sync_client::Config;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "hearth.toml";

/// Load the configuration.
///
/// An explicit path must exist. Without one, `hearth.toml` in the working
/// directory is used if present, otherwise the defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).context("Failed to load configuration"),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                Config::from_file(default).context("Failed to load configuration")
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Data directory: `--data-dir`, then `device.data_dir`, then the platform
/// data directory.
pub fn data_dir(flag: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    match flag.or_else(|| config.device.data_dir.clone()) {
        Some(dir) => Ok(dir),
        None => default_data_dir(),
    }
}

/// Get the default data directory for hearth-sync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("org", "hearth", "hearth-sync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
