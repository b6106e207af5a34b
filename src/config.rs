//! Orchestrator configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_downloads_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory model weight files are downloaded to and looked up in
    pub downloads_dir: PathBuf,
    /// Download progress poll period
    pub poll_interval_ms: u64,
    /// Bootstrap the GPU backend during first init
    pub use_accelerator: bool,
    /// Run a discarded decode pass after the session is created
    pub warm_up: bool,
    /// Fetch and log the timing report after each natural completion
    pub log_report_on_finish: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            poll_interval_ms: 100,
            use_accelerator: true,
            warm_up: true,
            log_report_on_finish: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_downloads_dir(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::with_downloads_dir("/tmp/models");
        assert_eq!(config.downloads_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.use_accelerator);
        assert!(config.warm_up);
    }

    #[test]
    fn test_partial_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "downloads_dir": "/data/models", "warm_up": false }"#).unwrap();

        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.downloads_dir, PathBuf::from("/data/models"));
        assert!(!config.warm_up);
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn test_bad_json_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let err = OrchestratorConfig::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }
}
