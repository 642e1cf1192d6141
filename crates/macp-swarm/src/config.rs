//! Configuration loading from `~/.macp/config.toml` with defaults.

use macp_types::config::MacpConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load the configuration from a TOML file.
///
/// Falls back to defaults, with a warning, when the file is missing or
/// cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> MacpConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MacpConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<MacpConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                MacpConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            MacpConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    macp_home().join("config.toml")
}

/// Get the MACP home directory (`MACP_HOME` or `~/.macp`).
pub fn macp_home() -> PathBuf {
    if let Ok(home) = std::env::var("MACP_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".macp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config, MacpConfig::default());
    }

    #[test]
    fn test_load_config_partial_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ipc]\npoll_interval_ms = 5\n\n[radio]\nchannel = 2").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.ipc.poll_interval_ms, 5);
        assert_eq!(config.ipc.datagram_poll_interval_ms, 100);
        assert_eq!(config.radio.channel, 2);
        assert_eq!(config.radio.macp_port, 0x09);
    }

    #[test]
    fn test_load_config_invalid_toml_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not [valid toml").unwrap();
        assert_eq!(load_config(Some(file.path())), MacpConfig::default());
    }
}
