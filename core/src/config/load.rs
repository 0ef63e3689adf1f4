use std::path::{Path, PathBuf};

use super::types::AppConfig;

/// Get the default taskmill data directory: ~/.taskmill
pub fn get_taskmill_data_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(PathBuf::from(home).join(".taskmill"))
}

/// Parse one specific config file. Missing keys fall back to defaults.
pub fn load_from_path(path: &Path) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<AppConfig>(&s)?)
}

/// Load configuration, preferring `~/.taskmill/config.toml`, then
/// `./taskmill.toml`, then built-in defaults. `TASKMILL_LOG` overrides the
/// configured log level.
pub fn load_default() -> anyhow::Result<AppConfig> {
    let data_dir = get_taskmill_data_dir()?;
    let home_config = data_dir.join("config.toml");

    let local_config = Path::new("taskmill.toml");

    let mut cfg: AppConfig = if home_config.exists() {
        load_from_path(&home_config)?
    } else if local_config.exists() {
        load_from_path(local_config)?
    } else {
        AppConfig::default()
    };

    // Default log files into the data directory rather than the OS temp dir.
    if cfg.logging.directory.is_none()
        || cfg
            .logging
            .directory
            .as_ref()
            .map(|s| s.trim().is_empty())
            .unwrap_or(false)
    {
        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        cfg.logging.directory = Some(logs_dir.to_string_lossy().to_string());
    }

    if let Ok(v) = std::env::var("TASKMILL_LOG") {
        if !v.trim().is_empty() {
            cfg.logging.level = v;
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_data_dir_under_home() {
        std::env::set_var("HOME", "/tmp/taskmill-test-home");
        let dir = get_taskmill_data_dir().unwrap();
        assert!(dir.ends_with(".taskmill"));
    }

    #[test]
    fn test_load_from_path_keeps_defaults_for_missing_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\ndrain_timeout_ms = 250\n").unwrap();

        let cfg = load_from_path(&path).unwrap();
        assert_eq!(cfg.engine.drain_timeout_ms, 250);
        assert_eq!(cfg.cleanup.retention_ms, 60_000);
        assert_eq!(cfg.monitor.max_concurrent, 5);
    }

    #[test]
    fn test_load_from_path_rejects_malformed_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "engine = \"not a table\"").unwrap();

        assert!(load_from_path(&path).is_err());
    }
}
