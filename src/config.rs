//! Client configuration
//!
//! One immutable [`ClientConfig`] is built at startup (defaults, optional TOML
//! file, CLI overrides) and handed to the devices, the playback sink and the
//! transport. Nothing reads audio parameters from globals.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub audio: AudioConfig,
    pub realtime: RealtimeConfig,
}

/// Fixed PCM configuration for capture and playback
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub capture_sample_rate: u32,

    /// Duration of one captured frame in milliseconds
    pub frame_duration_ms: u32,

    /// Rate used both to interpret received PCM16 and to open the output device
    pub playback_sample_rate: u32,

    /// Channel count on the wire (always mono)
    pub channels: u16,

    /// Bounded wait used by the playback loop and by `frames()`
    pub poll_interval_ms: u64,

    /// Audio buffered ahead of the output device before `write` blocks
    pub output_latency_ms: u32,

    /// Input device name, default device when unset
    pub input_device: Option<String>,

    /// Output device name, default device when unset
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            playback_sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
            channels: 1,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            output_latency_ms: DEFAULT_OUTPUT_LATENCY_MS,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Samples in one captured frame
    pub fn samples_per_frame(&self) -> usize {
        (self.capture_sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Bytes in one captured frame (PCM16 mono)
    pub fn bytes_per_frame(&self) -> usize {
        self.samples_per_frame() * PCM16_SAMPLE_BYTES
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Samples at `device_rate` allowed in the device buffer before `write` blocks
    pub fn output_low_water(&self, device_rate: u32) -> usize {
        (device_rate as usize * self.output_latency_ms as usize) / 1000
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channels != 1 {
            return Err(ConfigError::Invalid(format!(
                "only mono audio is supported, got {} channels",
                self.channels
            )));
        }
        if self.samples_per_frame() == 0 {
            return Err(ConfigError::Invalid(
                "frame duration too short for capture sample rate".to_string(),
            ));
        }
        if self.playback_sample_rate == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "playback rate and poll interval must be non-zero".to_string(),
            ));
        }
        if self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll interval {} ms exceeds {} ms",
                self.poll_interval_ms, MAX_POLL_INTERVAL_MS
            )));
        }
        if self.output_latency_ms > MAX_OUTPUT_LATENCY_MS {
            return Err(ConfigError::Invalid(format!(
                "output latency {} ms exceeds {} ms",
                self.output_latency_ms, MAX_OUTPUT_LATENCY_MS
            )));
        }
        Ok(())
    }
}

/// Remote endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,

    /// Voice selector sent with the instructions
    pub voice: String,

    /// Environment variable holding the bearer credential
    pub api_key_env: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

impl RealtimeConfig {
    /// Read the bearer credential through `lookup` (normally `std::env::var`)
    pub fn api_key<F>(&self, lookup: F) -> Result<String, ConfigError>
    where
        F: FnOnce(&str) -> Option<String>,
    {
        lookup(&self.api_key_env)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(self.api_key_env.clone()))
    }
}

impl ClientConfig {
    /// Parse a TOML document; missing fields keep their defaults
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(text)?;
        config.audio.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the default location when it exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Self::from_toml(&text)
    }
}

/// `<config dir>/voice-duplex/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "voice-duplex")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.audio.samples_per_frame(), 1600);
        assert_eq!(config.audio.bytes_per_frame(), 3200);
        assert_eq!(config.audio.output_low_water(24000), 1200);
        assert_eq!(config.audio.output_low_water(48000), 2400);
        assert_eq!(config.realtime.voice, "alloy");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml(
            r#"
            [audio]
            frame_duration_ms = 20

            [realtime]
            voice = "verse"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.frame_duration_ms, 20);
        assert_eq!(config.audio.samples_per_frame(), 320);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.realtime.voice, "verse");
        assert_eq!(config.realtime.url, DEFAULT_REALTIME_URL);
    }

    #[test]
    fn test_stereo_rejected() {
        let result = ClientConfig::from_toml("[audio]\nchannels = 2\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_interval_bounds() {
        let result = ClientConfig::from_toml("[audio]\npoll_interval_ms = 9223372036854775807\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = ClientConfig::from_toml("[audio]\noutput_latency_ms = 600000\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = ClientConfig::from_toml("[audio]\npoll_interval_ms = 10000\n").unwrap();
        assert_eq!(config.audio.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_api_key() {
        let realtime = RealtimeConfig::default();
        let err = realtime.api_key(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential(ref name) if name == "OPENAI_API_KEY"));

        let err = realtime.api_key(|_| Some("  ".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential(_)));

        let key = realtime.api_key(|name| {
            assert_eq!(name, "OPENAI_API_KEY");
            Some("sk-test".to_string())
        });
        assert_eq!(key.unwrap(), "sk-test");
    }
}
