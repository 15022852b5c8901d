use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::endpoints;

/// Persisted as JSON in the platform config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub poll: PollConfig,
}

/// Polling cadence per resource; defaults mirror the deployed dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub article_limit: u32,
    pub articles_interval_secs: u64,
    pub articles_stale_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub overview_interval_secs: u64,
    pub recent_limit: u32,
    pub recent_interval_secs: u64,
    pub recent_stale_secs: u64,
    pub stats_interval_secs: u64,
    pub stats_retry_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            ws_base_url: "ws://localhost:8000".to_string(),
            poll: PollConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            article_limit: 100,
            articles_interval_secs: 60,
            articles_stale_secs: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            overview_interval_secs: 60,
            recent_limit: 20,
            recent_interval_secs: 30,
            recent_stale_secs: 15,
            stats_interval_secs: 15,
            stats_retry_attempts: 2,
        }
    }
}

impl MonitorConfig {
    pub fn ws_disasters_url(&self) -> String {
        format!(
            "{}{}",
            self.ws_base_url.trim_end_matches('/'),
            endpoints::WS_DISASTERS
        )
    }

    pub fn config_file_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_dir =
            dirs::config_dir().ok_or("could not locate the user configuration directory")?;
        let app_dir = config_dir.join("disaster-monitor");
        std::fs::create_dir_all(&app_dir)?;
        Ok(app_dir.join("config.json"))
    }

    /// Loads the configuration, or creates and persists the defaults
    /// when the file is missing or unreadable.
    pub fn load() -> Self {
        match Self::load_from_file() {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "could not load configuration; using defaults");
                let config = Self::default();
                if let Err(save_err) = config.save() {
                    warn!(%save_err, "could not persist default configuration");
                }
                config
            }
        }
    }

    fn load_from_file() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_file_path()?;
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_file_path()?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
