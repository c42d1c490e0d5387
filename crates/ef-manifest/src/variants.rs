//! Per-task outputs consumed by the master assembler.

use ef_core::{AudioCodec, DynamicRange};
use serde::{Deserialize, Serialize};

/// One video rendition with its media playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPlaylist {
    /// Output label (e.g. "1080p").
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Peak bitrate in bits per second.
    pub bandwidth: u64,
    /// Average bitrate in bits per second, when measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_bandwidth: Option<u64>,
    /// Video codec string (e.g. "avc1.640028").
    pub codecs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    #[serde(default)]
    pub dynamic_range: DynamicRange,
    /// Media playlist path relative to the master playlist.
    pub uri: String,
}

/// One audio rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioVariant {
    /// Display name (NAME attribute).
    pub name: String,
    pub codec: AudioCodec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    /// Bitrate in bits per second.
    pub bandwidth: u64,
    #[serde(default)]
    pub default: bool,
    pub uri: String,
}

/// One subtitle rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleVariant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub default: bool,
    pub uri: String,
}
