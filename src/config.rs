//! Runtime settings.
//!
//! Settings are read from a JSON file (`configs/settings.json` by default) with
//! environment overrides applied on top. API keys normally come from the
//! environment, never from the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory that attachment ids are resolved against.
    pub vault_root: PathBuf,
    /// Address the host bridge listens on.
    pub listen_addr: String,
    pub local: LocalSettings,
    pub openai: VisionSettings,
    pub gemini: VisionSettings,
    /// Indicator patterns applied to recognized text.
    pub indicator_patterns: Vec<IndicatorPattern>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vault_root: PathBuf::from("."),
            listen_addr: "127.0.0.1:3017".to_string(),
            local: LocalSettings::default(),
            openai: VisionSettings::default(),
            gemini: VisionSettings::default(),
            indicator_patterns: Vec::new(),
        }
    }
}

/// Local Tesseract workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub enabled: bool,
    pub id: Option<String>,
    pub binary: PathBuf,
    pub language: String,
    /// Worker threads, which is also the backend's concurrency limit.
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            id: None,
            binary: PathBuf::from("tesseract"),
            language: "eng".to_string(),
            concurrency: 1,
            timeout_secs: 60,
        }
    }
}

/// A remote vision-model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionSettings {
    pub enabled: bool,
    pub id: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            id: None,
            api_key: None,
            base_url: None,
            model: None,
            concurrency: 2,
            timeout_secs: 60,
        }
    }
}

/// A regex-based pattern turning recognized text into typed indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorPattern {
    /// Indicator kind reported for matches (e.g. "ipv4", "domain", "sha256")
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// Regex pattern string (first capture group wins when present)
    pub pattern: String,
    /// Optional normalization: "lowercase" | "uppercase" | "refang"
    #[serde(default)]
    pub normalize: Option<String>,
    /// Whether to drop repeated values within one text (default true)
    #[serde(default = "default_true")]
    pub deduplicate: bool,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from `path` if it exists, otherwise start from defaults.
    /// Environment overrides are applied in both cases.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings: {:?}", path))?;
            let settings: Settings = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse settings: {:?}", path))?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            info!("No settings file at {:?}, using defaults", path);
            Settings::default()
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("OCR_VAULT_ROOT") {
            self.vault_root = PathBuf::from(root);
        }
        if let Ok(addr) = std::env::var("OCR_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
    }
}
