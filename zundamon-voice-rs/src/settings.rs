//! Persisted runtime settings.
//!
//! Key-value pairs stored as JSON in ~/.config/zundamon-voice/settings.json.
//! Read once at startup (overlaid on config defaults) and republished to
//! every component through a watch channel whenever they change.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, MouseButton};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub enabled: bool,
    pub mouse_button: MouseButton,
    pub auto_send: bool,
    pub speaker_id: u32,
    pub avatar_enabled: bool,
    pub hotkey_enabled: bool,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.speech.enabled,
            mouse_button: config.hotkey.mouse_button,
            auto_send: config.hotkey.auto_send,
            speaker_id: config.voicevox.speaker_id,
            avatar_enabled: config.avatar.enabled,
            hotkey_enabled: config.hotkey.enabled,
        }
    }
}

/// Default settings file path.
pub fn settings_file() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config/zundamon-voice/settings.json"))
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    /// Load persisted settings on top of `defaults`. Unknown or malformed
    /// keys in the file are ignored with a warning.
    pub fn load(path: Option<PathBuf>, defaults: Settings) -> Self {
        let settings = match path.as_ref().and_then(|p| fs::read_to_string(p).ok()) {
            Some(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(stored) => overlay(&defaults, &stored).unwrap_or_else(|e| {
                    warn!("Ignoring stored settings: {e}");
                    defaults.clone()
                }),
                Err(e) => {
                    warn!("Failed to parse settings file: {e}");
                    defaults
                }
            },
            None => defaults,
        };

        info!("Settings: {settings:?}");
        let (tx, _rx) = watch::channel(settings);
        Self { path, tx }
    }

    /// In-memory store, never written to disk.
    pub fn ephemeral(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self { path: None, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Apply a partial JSON update, persist it, and notify subscribers.
    pub fn update(&self, patch: &Value) -> Result<Settings> {
        let updated = overlay(&self.current(), patch)?;
        self.persist(&updated);
        self.tx.send_replace(updated.clone());
        info!("Settings updated: {updated:?}");
        Ok(updated)
    }

    fn persist(&self, settings: &Settings) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(settings) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    warn!("Failed to write settings: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize settings: {e}"),
        }
    }
}

fn overlay(base: &Settings, updates: &Value) -> Result<Settings> {
    let Some(updates) = updates.as_object() else {
        return Err(Error::Config("settings update must be a JSON object".into()));
    };
    let mut merged = serde_json::to_value(base)?;
    if let Some(obj) = merged.as_object_mut() {
        for (k, v) in updates {
            if obj.contains_key(k) {
                obj.insert(k.clone(), v.clone());
            } else {
                warn!("Unknown setting: {k}");
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}
