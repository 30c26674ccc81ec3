use crate::errors::AppResult;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub log_filter: String,
    pub log_to_file: bool,
    pub worker_limit: usize,
    pub max_queue_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_file: "reminders.sqlite".to_string(),
            log_filter: "info".to_string(),
            log_to_file: true,
            worker_limit: 2,
            max_queue_size: 8192,
        }
    }
}

impl AppConfig {
    /// Reads a YAML config. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.to_string_lossy(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.to_string_lossy()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml("data_dir: /var/lib/wiseyoung\nworker_limit: 4\n").expect("parse");
        assert_eq!(config.worker_limit, 4);
        assert_eq!(config.max_queue_size, 8192);
        assert_eq!(
            config.database_path().to_string_lossy(),
            "/var/lib/wiseyoung/reminders.sqlite"
        );
    }

    #[test]
    fn default_queue_holds_every_reminder_of_thousands_of_events() {
        let config = AppConfig::default();
        assert!(config.max_queue_size >= 3 * 2000);
    }

    #[test]
    fn missing_file_yields_defaults_and_bad_yaml_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = AppConfig::load(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(missing, AppConfig::default());

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "worker_limit: [not a number").expect("write");
        assert!(AppConfig::load(&bad).is_err());
    }
}
