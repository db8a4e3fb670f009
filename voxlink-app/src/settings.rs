//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxlink_core::{
    session::{persona, DEFAULT_MODEL, DEFAULT_VOICE},
    GeminiLiveConfig, SessionConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub language: String,
    pub model: String,
    pub voice: Option<String>,
    /// A built-in preset name (`cyberbuddy`, `assistant`) or a full prompt.
    pub persona: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub output_transcription: bool,
    pub frame_samples: usize,
    pub connect_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            language: "English".into(),
            model: DEFAULT_MODEL.into(),
            voice: Some(DEFAULT_VOICE.into()),
            persona: "cyberbuddy".into(),
            api_key: None,
            endpoint: None,
            output_transcription: true,
            frame_samples: 4_096,
            connect_timeout_secs: 15,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = AppSettings::default();
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.voice = trimmed(self.voice.take());
        self.api_key = trimmed(self.api_key.take());
        self.endpoint = trimmed(self.endpoint.take());
        self.language = self.language.trim().to_string();
        if self.language.is_empty() {
            self.language = defaults.language;
        }
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = defaults.model;
        }
        if self.persona.trim().is_empty() {
            self.persona = defaults.persona;
        }
        self.frame_samples = self.frame_samples.clamp(512, 16_384);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 120);
    }

    /// Overlay `VOXLINK_API_KEY` / `GEMINI_API_KEY` and `VOXLINK_LANGUAGE`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("VOXLINK_API_KEY").or_else(|| lookup("GEMINI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(language) = lookup("VOXLINK_LANGUAGE") {
            self.language = language;
        }
        self.normalize();
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            frame_samples: self.frame_samples,
            model: self.model.clone(),
            voice: self.voice.clone(),
            persona: persona::preset(&self.persona)
                .map(str::to_string)
                .unwrap_or_else(|| self.persona.clone()),
            output_transcription: self.output_transcription,
            ..SessionConfig::default()
        }
    }

    pub fn gemini_config(&self) -> GeminiLiveConfig {
        let mut config = GeminiLiveConfig::with_api_key(self.api_key.clone().unwrap_or_default());
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("VoxLink")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxlink")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
