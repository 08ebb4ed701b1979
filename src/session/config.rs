//! Per-device session configuration

use serde::{Deserialize, Serialize};

/// Streaming configuration for one device.
///
/// Immutable value type; updates go through [`SessionConfig::merged`] so
/// unspecified fields keep their prior values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Stream the device screen
    pub video: bool,
    /// Stream device audio
    pub audio: bool,
    /// Open the control (input injection) channel
    pub control: bool,
    /// Frame rate cap passed to the device encoder (0 = unlimited)
    pub max_fps: u32,
    /// Video bit rate in bits per second (0 = agent default)
    pub video_bit_rate: u32,
    /// Longest display dimension cap (0 = native resolution)
    pub max_size: u32,
    /// Raw codec options forwarded to the device encoder
    pub video_codec_options: String,
    /// Audio codec requested from the agent
    pub audio_codec: String,
    /// Agent log level
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
            control: true,
            max_fps: 0,
            video_bit_rate: 8_000_000,
            max_size: 0,
            video_codec_options: String::new(),
            audio_codec: "opus".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Whether any channel is enabled; a session with nothing enabled
    /// cannot start.
    pub fn any_channel_enabled(&self) -> bool {
        self.video || self.audio || self.control
    }

    /// Produce a new config with the patch's populated fields applied over
    /// this one.
    pub fn merged(&self, patch: &SessionConfigPatch) -> SessionConfig {
        SessionConfig {
            video: patch.video.unwrap_or(self.video),
            audio: patch.audio.unwrap_or(self.audio),
            control: patch.control.unwrap_or(self.control),
            max_fps: patch.max_fps.unwrap_or(self.max_fps),
            video_bit_rate: patch.video_bit_rate.unwrap_or(self.video_bit_rate),
            max_size: patch.max_size.unwrap_or(self.max_size),
            video_codec_options: patch
                .video_codec_options
                .clone()
                .unwrap_or_else(|| self.video_codec_options.clone()),
            audio_codec: patch
                .audio_codec
                .clone()
                .unwrap_or_else(|| self.audio_codec.clone()),
            log_level: patch
                .log_level
                .clone()
                .unwrap_or_else(|| self.log_level.clone()),
        }
    }
}

/// Partial config update: only populated fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfigPatch {
    pub video: Option<bool>,
    pub audio: Option<bool>,
    pub control: Option<bool>,
    pub max_fps: Option<u32>,
    pub video_bit_rate: Option<u32>,
    pub max_size: Option<u32>,
    pub video_codec_options: Option<String>,
    pub audio_codec: Option<String>,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let base = SessionConfig::default();
        let patch = SessionConfigPatch {
            audio: Some(true),
            max_fps: Some(60),
            ..Default::default()
        };
        let merged = base.merged(&patch);
        assert!(merged.audio);
        assert_eq!(merged.max_fps, 60);
        assert_eq!(merged.video, base.video);
        assert_eq!(merged.video_bit_rate, base.video_bit_rate);
        assert_eq!(merged.audio_codec, base.audio_codec);
    }

    #[test]
    fn test_empty_patch_is_identity() {
        let base = SessionConfig::default();
        assert_eq!(base.merged(&SessionConfigPatch::default()), base);
    }

    #[test]
    fn test_any_channel_enabled() {
        let mut config = SessionConfig::default();
        assert!(config.any_channel_enabled());
        config.video = false;
        config.audio = false;
        config.control = false;
        assert!(!config.any_channel_enabled());
    }

    #[test]
    fn test_patch_deserializes_sparse_json() {
        let patch: SessionConfigPatch =
            serde_json::from_str(r#"{"video": false, "max_size": 1280}"#).unwrap();
        assert_eq!(patch.video, Some(false));
        assert_eq!(patch.max_size, Some(1280));
        assert_eq!(patch.audio, None);
    }
}
