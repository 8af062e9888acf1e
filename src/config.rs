//! Configuration loading and management
//!
//! Settings live in a JSON file under the user's data directory. The API key
//! is taken from the environment and never written back.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::protocol::KEY_COUNT;

/// Default conversation endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Environment variable holding the API key
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Environment variable overriding the config file location
pub const CONFIG_PATH_VAR: &str = "VOICEDECK_CONFIG";

/// Conversation service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: "gemini-2.0-flash-exp".to_string(),
            voice: "Puck".to_string(),
            system_instruction: None,
        }
    }
}

/// Microphone and speaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Input device name; default microphone when unset
    pub input_device: Option<String>,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 4096,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

/// Button deck settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub push_to_talk_key: u8,
    pub toggle_key: u8,
    /// Backlight brightness in percent
    pub brightness: u8,
    /// Directory of pre-encoded key images
    pub icons_dir: Option<PathBuf>,
    /// Discover a new device instead of reopening the last one
    pub show_picker: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            push_to_talk_key: 0,
            toggle_key: 1,
            brightness: 60,
            icons_dir: None,
            show_picker: true,
        }
    }
}

/// Recording behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Delay before the turn signal follows a stop; 0 sends immediately
    pub turn_signal_delay_ms: u64,
    /// Transcript fragments kept in memory
    pub transcript_history: usize,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            turn_signal_delay_ms: 0,
            transcript_history: 64,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionSettings,
    pub audio: AudioSettings,
    pub device: DeviceSettings,
    pub recording: RecordingSettings,

    /// Conversation service API key, from the environment only
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Config {
    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        let keys = [self.device.push_to_talk_key, self.device.toggle_key];
        if keys.iter().any(|&k| usize::from(k) >= KEY_COUNT) {
            bail!("recording keys must be below {}", KEY_COUNT);
        }
        if keys[0] == keys[1] {
            bail!("push-to-talk and toggle must use different keys");
        }
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            bail!("sample rates must be non-zero");
        }
        if self.audio.frame_samples == 0 {
            bail!("frame size must be non-zero");
        }
        Ok(())
    }
}

/// Source of persisted settings
pub trait ConfigProvider {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

/// JSON file provider
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Provider at `$VOICEDECK_CONFIG` or `~/.local/share/voicedeck/config.json`
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return Ok(Self::new(path));
        }

        let home = std::env::var("HOME").context("HOME is not set")?;
        let path = PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("voicedeck")
            .join("config.json");
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<Config> {
        let mut config = if self.path.exists() {
            let text = std::fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config in {}", self.path.display()))?
        } else {
            Config::default()
        };

        config.api_key = std::env::var(API_KEY_VAR).ok().filter(|k| !k.is_empty());
        Ok(config)
    }

    fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let text = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("voicedeck-config-{}-{}", name, std::process::id()))
            .join("config.json")
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let provider = FileConfigProvider::new(temp_path("missing"));
        let config = provider.load().unwrap();
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("roundtrip");
        let provider = FileConfigProvider::new(&path);

        let mut config = Config::default();
        config.session.voice = "Kore".to_string();
        config.device.brightness = 30;
        config.api_key = Some("do-not-persist".to_string());
        provider.save(&config).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("do-not-persist"));

        let loaded = provider.load().unwrap();
        assert_eq!(loaded.session.voice, "Kore");
        assert_eq!(loaded.device.brightness, 30);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("partial");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"device":{"toggle_key":4}}"#).unwrap();

        let config = FileConfigProvider::new(&path).load().unwrap();
        assert_eq!(config.device.toggle_key, 4);
        assert_eq!(config.device.push_to_talk_key, 0);
        assert_eq!(config.recording.transcript_history, 64);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_validate_rejects_shared_key() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.device.toggle_key = config.device.push_to_talk_key;
        assert!(config.validate().is_err());

        config.device.toggle_key = 15;
        assert!(config.validate().is_err());
    }
}
