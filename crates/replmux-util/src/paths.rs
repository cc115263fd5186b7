//! Default paths for replmux components
//!
//! Paths are user-writable by default:
//! - Config: `$XDG_CONFIG_HOME/replmux/config.toml` or `~/.config/replmux/config.toml`
//! - Logs: `$XDG_STATE_HOME/replmux` or `~/.local/state/replmux`

use std::path::PathBuf;

/// Environment variable for overriding the config file path
pub const REPLMUX_CONFIG_ENV: &str = "REPLMUX_CONFIG";

/// Config filename within the config directory
const CONFIG_FILENAME: &str = "config.toml";

/// Application subdirectory name
const APP_DIR: &str = "replmux";

/// Get the default config file path.
///
/// Order of precedence:
/// 1. `$REPLMUX_CONFIG` environment variable (if set)
/// 2. `$XDG_CONFIG_HOME/replmux/config.toml` (if XDG_CONFIG_HOME is set)
/// 3. the platform config dir (`~/.config` on Linux)
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(REPLMUX_CONFIG_ENV) {
        return PathBuf::from(path);
    }

    config_path_without_env()
}

/// Get the config path without checking REPLMUX_CONFIG.
/// Used as the clap default where the env var is wired separately.
pub fn config_path_without_env() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join(CONFIG_FILENAME);
    }

    if let Some(dir) = dirs::config_dir() {
        return dir.join(APP_DIR).join(CONFIG_FILENAME);
    }

    // Last resort
    PathBuf::from("/tmp").join(APP_DIR).join(CONFIG_FILENAME)
}

/// Get the default log directory.
///
/// Order of precedence:
/// 1. `$XDG_STATE_HOME/replmux` (if XDG_STATE_HOME is set)
/// 2. `~/.local/state/replmux` (fallback)
pub fn default_log_dir() -> PathBuf {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(state_home).join(APP_DIR);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("state").join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR).join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_contains_replmux() {
        let path = config_path_without_env();
        assert!(path.to_string_lossy().contains("replmux"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn log_dir_contains_replmux() {
        let path = default_log_dir();
        assert!(path.to_string_lossy().contains("replmux"));
    }
}
