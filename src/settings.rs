use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

pub const DB_FILENAME: &str = "tbingest.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub advisory: AdvisorySettings,
}

/// Connection details for the optional column/description advisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorySettings {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Suggestions at or below this confidence are ignored.
    pub min_confidence: f64,
}

impl Default for AdvisorySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "TBINGEST_API_KEY".to_string(),
            timeout_secs: 30,
            min_confidence: 0.7,
        }
    }
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_max_file_size_mb() -> u64 {
    20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            default_currency: default_currency(),
            max_file_size_mb: default_max_file_size_mb(),
            advisory: AdvisorySettings::default(),
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DB_FILENAME)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tbingest")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("tbingest")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| IngestError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings {
            data_dir: "/tmp/test".to_string(),
            ..Settings::default()
        };
        settings.default_currency = "CHF".to_string();
        settings.advisory.enabled = true;
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.default_currency, "CHF");
        assert!(loaded.advisory.enabled);
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.default_currency, "EUR");
        assert_eq!(s.max_file_size_mb, 20);
        assert_eq!(s.max_file_size_bytes(), 20 * 1024 * 1024);
        assert!(!s.advisory.enabled);
        assert_eq!(s.advisory.min_confidence, 0.7);
        assert!(s.db_path().ends_with(DB_FILENAME));
    }

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test", "advisory": {"enabled": true, "model": "local"}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.default_currency, "EUR");
        assert_eq!(s.max_file_size_mb, 20);
        assert!(s.advisory.enabled);
        assert_eq!(s.advisory.model, "local");
        assert_eq!(s.advisory.timeout_secs, 30);
    }

    #[test]
    fn test_shellexpand_tilde() {
        let expanded = shellexpand_path("~/books");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("books"));
    }
}
