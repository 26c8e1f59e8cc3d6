//! Configuration loading from `~/.tether/config.toml`.

use std::path::{Path, PathBuf};
use tether_types::EndpointConfig;
use tracing::info;

/// Load configuration from a TOML file, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> EndpointConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<EndpointConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    EndpointConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}

/// Get the default tether home directory.
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tether")
}
