//! Configuration tests
//!
//! Covers the on-disk layout and the rules `import` enforces.

#[cfg(test)]
mod tests {
    use super::super::config::{AppConfig, CONFIG_PATH_ENV};
    use tempfile::tempdir;

    #[test]
    fn test_env_override_selects_config_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.json");

        std::env::set_var(CONFIG_PATH_ENV, &path);
        let resolved = AppConfig::get_config_path().unwrap();
        std::env::remove_var(CONFIG_PATH_ENV);

        assert_eq!(resolved, path);
    }

    #[test]
    fn test_import_rejects_invalid_values() {
        let mut config = AppConfig::default();
        config.history.retention_hours = 0;
        let json = serde_json::to_string(&config).unwrap();
        assert!(AppConfig::import(&json).is_err());

        assert!(AppConfig::import("{ \"download\": 3 }").is_err());
    }

    #[test]
    fn test_saved_file_uses_section_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        AppConfig::default().save_to(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["download"]["audio_quality"], "192K");
        assert_eq!(raw["download"]["recent_file_window_secs"], 60);
        assert_eq!(raw["tool"]["binary"], "yt-dlp");
        assert_eq!(raw["history"]["retention_hours"], 24);
        assert_eq!(raw["advanced"]["log_level"], "info");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }
}
