//! Configuration file lookup and logger setup for the CLI.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use stagehand_core::EngineConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the engine configuration file.
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "stagehand").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load the engine configuration.
///
/// An explicit path must exist and parse. Without one the default location
/// is tried and a missing or broken file falls back to the defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    match explicit {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(config_path()
            .map(|path| EngineConfig::load_or_default(&path))
            .unwrap_or_default()),
    }
}

/// Write a commented default configuration to `path`.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let body = EngineConfig::default()
        .to_toml_string()
        .context("Failed to serialize default config")?;
    let content = format!(
        "# stagehand configuration\n#\n# clock: \"realtime\", \"free\" or \"manual\"\n\n{}",
        body
    );
    fs::write(path, content).with_context(|| format!("Failed to write: {}", path.display()))?;
    Ok(())
}

/// Initialize `env_logger`. `RUST_LOG` wins over the configured level.
pub fn init_logger(default_level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::ClockMode;

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "clock = \"manual\"\ndefault_tempo = 90.0\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.clock, ClockMode::Manual);
        assert!((config.default_tempo - 90.0).abs() < 1e-9);
        assert_eq!(config.idle_poll_ms, EngineConfig::default().idle_poll_ms);
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();
        assert_eq!(load_config(Some(&path)).unwrap(), EngineConfig::default());
    }
}
