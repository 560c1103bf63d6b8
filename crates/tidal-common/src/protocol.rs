//! Signaling wire protocol: JSON messages exchanged with the streaming host.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Audio sample rates the host pipeline can be asked for.
pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [44_100, 48_000];
/// Accepted audio bitrate range in bits per second.
pub const AUDIO_BITRATE_RANGE: std::ops::RangeInclusive<u32> = 32_000..=512_000;

/// Signaling message exchanged with the streaming host over the WebSocket.
///
/// One JSON object per frame, discriminated by a kebab-case `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Viewer offer, carrying the capture parameters the host should use.
    Offer { sdp: String, config: StreamConfig },

    /// Host answer to an offer.
    Answer { sdp: String },

    /// Serialized `RTCIceCandidateInit` JSON, sent in both directions.
    IceCandidate { candidate: String },

    /// Capture sources the host can stream.
    #[serde(rename = "monitors")]
    SourceList {
        #[serde(rename = "monitors")]
        sources: Vec<SourceInfo>,
    },

    /// Audio devices available on the host.
    #[serde(rename = "audio-devices")]
    AudioDeviceList { devices: Vec<AudioDeviceInfo> },

    /// Host-side error report.
    Error { message: String },
}

impl SignalMessage {
    /// Parse one inbound frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::malformed)
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::serialization)
    }

    /// Wire tag, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::SourceList { .. } => "monitors",
            Self::AudioDeviceList { .. } => "audio-devices",
            Self::Error { .. } => "error",
        }
    }
}

/// Capture configuration sent alongside the offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// e.g. "x11-0", "wayland-portal", "camera-0", "test"
    pub source_type: String,
    pub audio_source: Option<String>,
    pub enable_audio: bool,
    /// Send the viewer's microphone to the host.
    pub enable_microphone_input: bool,
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
    pub resolution: (u32, u32),
    pub framerate: u32,
    pub use_hardware_encoding: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source_type: "x11-0".to_string(),
            audio_source: None,
            enable_audio: false,
            enable_microphone_input: false,
            audio_bitrate: 128_000,
            audio_sample_rate: 48_000,
            resolution: (1920, 1080),
            framerate: 30,
            use_hardware_encoding: true,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.resolution;
        if width == 0 || height == 0 {
            return Err(Error::config(format!(
                "resolution must be non-zero, got {width}x{height}"
            )));
        }
        if self.framerate == 0 {
            return Err(Error::config("framerate must be non-zero"));
        }
        if self.source_type.trim().is_empty() {
            return Err(Error::config("source_type must not be empty"));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio_sample_rate) {
            return Err(Error::config(format!(
                "unsupported audio sample rate {}",
                self.audio_sample_rate
            )));
        }
        if !AUDIO_BITRATE_RANGE.contains(&self.audio_bitrate) {
            return Err(Error::config(format!(
                "audio bitrate {} outside {}..={}",
                self.audio_bitrate,
                AUDIO_BITRATE_RANGE.start(),
                AUDIO_BITRATE_RANGE.end()
            )));
        }
        Ok(())
    }
}

/// A capture source advertised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    /// "screen" or "camera"
    #[serde(rename = "type", alias = "source_type")]
    pub source_type: String,
    pub resolution: String,
    #[serde(default)]
    pub primary: bool,
}

/// An audio device advertised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// "microphone", "system" or "application"
    pub device_type: String,
}

/// Pick the source the viewer should request: the primary one if flagged,
/// otherwise the first advertised.
pub fn preferred_source(sources: &[SourceInfo]) -> Option<&SourceInfo> {
    sources.iter().find(|s| s.primary).or_else(|| sources.first())
}
