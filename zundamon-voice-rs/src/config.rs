//! Configuration management for zundamon-voice.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so a missing or partial file is never an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which mouse side button drives voice input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    /// Button 3 (back)
    #[default]
    Side1,
    /// Button 4 (forward)
    Side2,
    Both,
}

impl MouseButton {
    /// Whether a DOM-style button number (3 or 4) is a target of this setting.
    pub fn matches(self, button: u8) -> bool {
        match self {
            Self::Side1 => button == 3,
            Self::Side2 => button == 4,
            Self::Both => button == 3 || button == 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    pub enabled: bool,
    pub mouse_button: MouseButton,
    pub auto_send: bool,
    pub send_delay_ms: u64,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mouse_button: MouseButton::Side1,
            auto_send: true,
            send_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoicevoxConfig {
    pub host: String,
    pub speaker_id: u32,
    pub timeout_secs: u64,
    /// Budget for the `/version` wake probe.
    pub probe_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:50021".into(),
            speaker_id: 3,
            timeout_secs: 10,
            probe_timeout_ms: 1000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub chunk_max_chars: usize,
    pub max_prefetch: usize,
    pub prefetch_wait_ms: u64,
    pub history: bool,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_max_chars: 50,
            max_prefetch: 5,
            prefetch_wait_ms: 3000,
            history: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub streaming_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            streaming_timeout_ms: 10_000,
            settle_delay_ms: 500,
        }
    }
}

/// One find/replace step of the reasoning-trace scrubber.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrubberConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Replaces the built-in scrubber list when set.
    pub scrubbers: Option<Vec<ScrubberConfig>>,
    /// Replaces the built-in UI chrome strings when set.
    pub ui_strings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub enabled: bool,
    pub relay_url: String,
    pub reconnect_secs: u64,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_url: "ws://127.0.0.1:8765".into(),
            reconnect_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ws_port: u16,
    pub osc_host: String,
    pub osc_port: u16,
    pub decay_secs: u64,
    pub idle_interval_secs: u64,
    pub idle_on_start: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_port: 8765,
            osc_host: "127.0.0.1".into(),
            osc_port: 39540,
            decay_secs: 5,
            idle_interval_secs: 10,
            idle_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8767 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hotkey: HotkeyConfig,
    pub voicevox: VoicevoxConfig,
    pub speech: SpeechConfig,
    pub observer: ObserverConfig,
    pub normalizer: NormalizerConfig,
    pub avatar: AvatarConfig,
    pub relay: RelayConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/zundamon-voice/config.yaml
    /// 3. /etc/zundamon-voice/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/zundamon-voice/config.yaml")),
                Some(PathBuf::from("/etc/zundamon-voice/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::parse(
            "voicevox:\n  speaker_id: 1\nhotkey:\n  mouse_button: both\n",
        )
        .unwrap();
        assert_eq!(config.voicevox.speaker_id, 1);
        assert_eq!(config.voicevox.host, "http://localhost:50021");
        assert_eq!(config.hotkey.mouse_button, MouseButton::Both);
        assert_eq!(config.speech.chunk_max_chars, 50);
        assert_eq!(config.relay.osc_port, 39540);
    }

    #[test]
    fn custom_scrubbers() {
        let config = Config::parse(
            "normalizer:\n  scrubbers:\n    - pattern: 'foo.+?\\.'\n    - pattern: bar\n      replacement: baz\n",
        )
        .unwrap();
        let scrubbers = config.normalizer.scrubbers.unwrap();
        assert_eq!(scrubbers.len(), 2);
        assert_eq!(scrubbers[0].replacement, "");
        assert_eq!(scrubbers[1].replacement, "baz");
    }

    #[test]
    fn mouse_button_matching() {
        assert!(MouseButton::Side1.matches(3));
        assert!(!MouseButton::Side1.matches(4));
        assert!(MouseButton::Side2.matches(4));
        assert!(MouseButton::Both.matches(3) && MouseButton::Both.matches(4));
        assert!(!MouseButton::Both.matches(0));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/zundamon.yaml")));
        assert_eq!(config.api.port, 8767);
        assert!(!config.avatar.enabled);
    }
}
