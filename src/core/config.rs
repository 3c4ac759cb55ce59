//! Application configuration management

use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the configuration file location
pub const CONFIG_PATH_ENV: &str = "VURDE_CONFIG";

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Main application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub download: DownloadConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Download-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub download_path: PathBuf,
    pub audio_quality: String, // "128K", "192K", "320K"
    pub video_quality: String, // "best"; the video format string is fixed
    pub concurrent_downloads: usize,
    /// Window used to attribute freshly written files to a finished job
    pub recent_file_window_secs: u64,
}

/// External downloader binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub binary: String,
    /// Arguments placed before every generated flag
    #[serde(default)]
    pub base_args: Vec<String>,
    pub max_probe_redirects: usize,
}

/// Persisted history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Absolute path, or relative to the data directory
    pub file_name: String,
    pub retention_hours: i64,
    pub sweep_interval_secs: u64,
}

/// Advanced configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    pub log_level: String, // "error", "warn", "info", "debug", "trace"
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            tool: ToolConfig::default(),
            history: HistoryConfig::default(),
            advanced: AdvancedConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let download_path = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("downloads"));

        Self {
            download_path,
            audio_quality: "192K".to_string(),
            video_quality: "best".to_string(),
            concurrent_downloads: 3,
            recent_file_window_secs: 60,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            base_args: Vec::new(),
            max_probe_redirects: 5,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file_name: "downloads.json".to_string(),
            retention_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, writing defaults when missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let config: AppConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let project_dirs = ProjectDirs::from("com", "vurde", "vurde")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Get the application data directory
    pub fn get_data_dir() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "vurde", "vurde")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.data_dir().to_path_buf())
    }

    /// Resolve the history file against the data directory
    pub fn history_path(&self) -> Result<PathBuf> {
        let file = PathBuf::from(&self.history.file_name);
        if file.is_absolute() {
            return Ok(file);
        }
        Ok(Self::get_data_dir()?.join(file))
    }

    /// Export configuration as JSON string
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "Failed to export configuration")
    }

    /// Import configuration from JSON string
    pub fn import(json: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(json).with_context(|| "Failed to parse imported configuration")?;

        config
            .validate()
            .with_context(|| "Imported configuration is invalid")?;

        tracing::info!("Imported and validated configuration from JSON");
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.download.concurrent_downloads == 0 {
            anyhow::bail!("Concurrent downloads must be greater than 0");
        }

        if self.download.concurrent_downloads > 20 {
            anyhow::bail!("Concurrent downloads should not exceed 20");
        }

        if crate::utils::validation::validate_audio_quality(&self.download.audio_quality).is_err()
        {
            anyhow::bail!("Invalid audio quality: {}", self.download.audio_quality);
        }

        if self.download.recent_file_window_secs == 0 {
            anyhow::bail!("Recent file window must be greater than 0 seconds");
        }

        if self.tool.binary.trim().is_empty() {
            anyhow::bail!("Tool binary must not be empty");
        }

        if self.tool.max_probe_redirects == 0 || self.tool.max_probe_redirects > 20 {
            anyhow::bail!("Probe redirect limit should be between 1 and 20");
        }

        if self.history.file_name.trim().is_empty() {
            anyhow::bail!("History file name must not be empty");
        }

        if self.history.retention_hours <= 0 {
            anyhow::bail!("History retention must be at least one hour");
        }

        if self.history.sweep_interval_secs == 0 {
            anyhow::bail!("Sweep interval must be greater than 0 seconds");
        }

        if !LOG_LEVELS.contains(&self.advanced.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download.concurrent_downloads, 3);
        assert_eq!(config.history.retention_hours, 24);
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let json = config.export().unwrap();
        let parsed_config = AppConfig::import(&json).unwrap();

        assert_eq!(config.export().unwrap(), parsed_config.export().unwrap());
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut config = AppConfig::default();

        config.download.concurrent_downloads = 0;
        assert!(config.validate().is_err());

        config.download.concurrent_downloads = 25;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.download.audio_quality = "loud".to_string();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.advanced.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.tool.max_probe_redirects = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_creates_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.tool.binary, "yt-dlp");

        let mut changed = config.clone();
        changed.download.concurrent_downloads = 5;
        changed.save_to(&path).unwrap();

        let reloaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.download.concurrent_downloads, 5);
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let json = r#"{
            "download": {
                "download_path": "/tmp/media",
                "audio_quality": "320K",
                "video_quality": "best",
                "concurrent_downloads": 2,
                "recent_file_window_secs": 30
            }
        }"#;
        let config = AppConfig::import(json).unwrap();
        assert_eq!(config.download.concurrent_downloads, 2);
        assert_eq!(config.tool.max_probe_redirects, 5);
        assert_eq!(config.history.sweep_interval_secs, 3600);
    }

    #[test]
    fn test_absolute_history_path_is_kept() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        let file = dir.path().join("history.json");
        config.history.file_name = file.to_string_lossy().to_string();
        assert_eq!(config.history_path().unwrap(), file);
    }
}
