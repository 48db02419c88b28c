use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StudioError;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-2.0-generate-001";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 600;

const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub gemini_api_key: Option<String>,
    pub api_base: Option<String>,
    pub image_model: Option<String>,
    pub video_model: Option<String>,
    pub video_poll_interval_secs: Option<u64>,
    /// `0` disables the deadline entirely.
    pub video_poll_timeout_secs: Option<u64>,
}

impl Settings {
    /// Settings file first, then the environment.
    pub fn resolve_api_key(&self) -> Result<String, StudioError> {
        self.gemini_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS
                    .iter()
                    .filter_map(|name| std::env::var(name).ok())
                    .find(|k| !k.trim().is_empty())
            })
            .ok_or_else(|| {
                StudioError::Config(
                    "Gemini API key not set (settings.json, GEMINI_API_KEY or API_KEY)".to_string(),
                )
            })
    }

    pub fn api_base(&self) -> String {
        self.api_base
            .as_deref()
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_API_BASE)
            .to_string()
    }

    pub fn image_model(&self) -> String {
        self.image_model
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string())
    }

    pub fn video_model(&self) -> String {
        self.video_model
            .clone()
            .unwrap_or_else(|| DEFAULT_VIDEO_MODEL.to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.video_poll_interval_secs
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                .max(1),
        )
    }

    pub fn poll_deadline(&self) -> Option<Duration> {
        match self.video_poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings_from_dir(data_dir: &Path) -> Settings {
    let path = settings_path(data_dir);
    if let Ok(bytes) = fs::read(&path) {
        if let Ok(s) = serde_json::from_slice::<Settings>(&bytes) {
            return s;
        }
    }
    Settings::default()
}

pub fn save_settings_to_dir(data_dir: &Path, s: &Settings) -> Result<()> {
    let path = settings_path(data_dir);
    let json = serde_json::to_vec_pretty(s)?;
    fs::write(path, json).context("write settings")?;
    Ok(())
}
