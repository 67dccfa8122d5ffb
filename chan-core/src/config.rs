use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

const APP_DIR: &str = "chanwatch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub site: SiteConfig,
    pub watch: WatchConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub api_base_url: String,
    pub media_base_url: String,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub update_interval_seconds: u64,
    /// Backoff tier a sticky thread falls back to when it receives new posts.
    pub sticky_backoff_floor: usize,
    /// Re-arm the thread timer after every successful thread fetch.
    pub auto_reschedule: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: Option<PathBuf>,
    pub max_size_bytes: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://a.4cdn.org/".to_string(),
            media_base_url: "https://i.4cdn.org/".to_string(),
            user_agent: format!("chanwatch/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_seconds: 60,
            sticky_backoff_floor: 3,
            auto_reschedule: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_size_bytes: 100 * 1024 * 1024,
        }
    }
}

impl SiteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl WatchConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds.max(1))
    }
}

impl CacheConfig {
    /// Configured directory, or `<cache dir>/chanwatch/files`.
    pub fn resolved_directory(&self) -> PathBuf {
        match &self.directory {
            Some(dir) => dir.clone(),
            None => {
                let mut dir = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
                dir.push(APP_DIR);
                dir.push("files");
                dir
            }
        }
    }
}

impl AppConfig {
    /// Directory holding config.json and the persisted stores.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        let app_config_dir = config_dir.join(APP_DIR);
        std::fs::create_dir_all(&app_config_dir)?;
        Ok(app_config_dir)
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Loads the configuration file, falling back to (and persisting) defaults.
    pub fn load() -> Self {
        let path = match Self::config_file_path() {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "no config location, using defaults");
                return Self::default();
            }
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
                let default_config = Self::default();
                if let Err(save_err) = default_config.save_to(&path) {
                    warn!(error = %save_err, "failed to save default config");
                }
                default_config
            }
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_file_path()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "watch": { "sticky_backoff_floor": 0 } }"#).unwrap();
        assert_eq!(config.watch.sticky_backoff_floor, 0);
        assert_eq!(config.watch.update_interval_seconds, 60);
        assert_eq!(config.cache.max_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.site.api_base_url, "https://a.4cdn.org/");
    }

    #[test]
    fn save_then_load_keeps_values() {
        let mut path = std::env::temp_dir();
        path.push(format!("chanwatch_config_{}.json", std::process::id()));

        let mut config = AppConfig::default();
        config.cache.max_size_bytes = 4096;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.cache.max_size_bytes, 4096);

        let _ = std::fs::remove_file(&path);
    }
}
