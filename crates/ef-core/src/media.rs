//! Media-domain enums for containers, codecs, HDR formats and accelerators.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`) and
//! implement `Display` manually for consistent string representation. The
//! derived `Ord` is the canonical ordering used wherever output must be
//! deterministic (manifest groups, task naming).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Supported output container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    /// Segmented HLS (fMP4 or MPEG-TS segments plus media playlists).
    Hls,
    Mp4,
    Mkv,
    WebM,
}

impl Container {
    /// File extension of the primary artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Hls => "m3u8",
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::WebM => "webm",
        }
    }

    /// Whether outputs are split into segments referenced by a playlist.
    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::Hls)
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hls => write!(f, "hls"),
            Self::Mp4 => write!(f, "mp4"),
            Self::Mkv => write!(f, "mkv"),
            Self::WebM => write!(f, "webm"),
        }
    }
}

// ---------------------------------------------------------------------------
// VideoCodec
// ---------------------------------------------------------------------------

/// Supported video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
    Vp9,
}

impl VideoCodec {
    /// Parse a codec name as reported by ffprobe or written by users.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "avc1" | "x264" => Some(Self::H264),
            "h265" | "hevc" | "hvc1" | "hev1" | "x265" => Some(Self::H265),
            "av1" | "av01" => Some(Self::Av1),
            "vp9" | "vp09" => Some(Self::Vp9),
            _ => None,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::H265 => write!(f, "h265"),
            Self::Av1 => write!(f, "av1"),
            Self::Vp9 => write!(f, "vp9"),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioCodec
// ---------------------------------------------------------------------------

/// Audio codecs, both encodable and source-only (TrueHD, DTS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Ac3,
    Eac3,
    Opus,
    Flac,
    #[serde(rename = "truehd")]
    TrueHd,
    Dts,
}

impl AudioCodec {
    /// Parse a codec name as reported by ffprobe or written by users.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aac" | "mp4a" => Some(Self::Aac),
            "ac3" | "ac-3" => Some(Self::Ac3),
            "eac3" | "ec-3" | "e-ac-3" => Some(Self::Eac3),
            "opus" => Some(Self::Opus),
            "flac" => Some(Self::Flac),
            "truehd" => Some(Self::TrueHd),
            "dts" | "dca" => Some(Self::Dts),
            _ => None,
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aac => write!(f, "aac"),
            Self::Ac3 => write!(f, "ac3"),
            Self::Eac3 => write!(f, "eac3"),
            Self::Opus => write!(f, "opus"),
            Self::Flac => write!(f, "flac"),
            Self::TrueHd => write!(f, "truehd"),
            Self::Dts => write!(f, "dts"),
        }
    }
}

// ---------------------------------------------------------------------------
// SubtitleCodec
// ---------------------------------------------------------------------------

/// Subtitle formats. Bitmap formats (PGS, DVD) can only be burned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleCodec {
    WebVtt,
    Srt,
    Ass,
    MovText,
    Pgs,
    DvdSub,
}

impl SubtitleCodec {
    /// Parse a codec name as reported by ffprobe.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "webvtt" | "vtt" => Some(Self::WebVtt),
            "srt" | "subrip" => Some(Self::Srt),
            "ass" | "ssa" => Some(Self::Ass),
            "mov_text" | "tx3g" => Some(Self::MovText),
            "hdmv_pgs_subtitle" | "pgs" | "pgssub" => Some(Self::Pgs),
            "dvd_subtitle" | "dvdsub" => Some(Self::DvdSub),
            _ => None,
        }
    }

    /// Text formats can be converted between each other; bitmaps cannot.
    pub fn is_text(&self) -> bool {
        !matches!(self, Self::Pgs | Self::DvdSub)
    }
}

impl fmt::Display for SubtitleCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebVtt => write!(f, "webvtt"),
            Self::Srt => write!(f, "srt"),
            Self::Ass => write!(f, "ass"),
            Self::MovText => write!(f, "mov_text"),
            Self::Pgs => write!(f, "pgs"),
            Self::DvdSub => write!(f, "dvdsub"),
        }
    }
}

// ---------------------------------------------------------------------------
// HdrFormat / DynamicRange
// ---------------------------------------------------------------------------

/// HDR format classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HdrFormat {
    #[default]
    Sdr,
    Hdr10,
    #[serde(rename = "hdr10plus")]
    Hdr10Plus,
    #[serde(rename = "dolbyvision")]
    DolbyVision,
    Hlg,
}

impl HdrFormat {
    pub fn is_hdr(&self) -> bool {
        !matches!(self, Self::Sdr)
    }

    /// Transfer characteristic family used for playlist signalling.
    pub fn dynamic_range(&self) -> DynamicRange {
        match self {
            Self::Sdr => DynamicRange::Sdr,
            Self::Hlg => DynamicRange::Hlg,
            Self::Hdr10 | Self::Hdr10Plus | Self::DolbyVision => DynamicRange::Pq,
        }
    }
}

impl fmt::Display for HdrFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sdr => write!(f, "sdr"),
            Self::Hdr10 => write!(f, "hdr10"),
            Self::Hdr10Plus => write!(f, "hdr10plus"),
            Self::DolbyVision => write!(f, "dolbyvision"),
            Self::Hlg => write!(f, "hlg"),
        }
    }
}

/// `VIDEO-RANGE` classification of a variant. SDR sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DynamicRange {
    #[default]
    Sdr,
    Hlg,
    Pq,
}

impl DynamicRange {
    /// Attribute literal as written into the master playlist.
    pub fn as_attribute(&self) -> &'static str {
        match self {
            Self::Sdr => "SDR",
            Self::Hlg => "HLG",
            Self::Pq => "PQ",
        }
    }
}

impl fmt::Display for DynamicRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_attribute())
    }
}

// ---------------------------------------------------------------------------
// StreamType
// ---------------------------------------------------------------------------

/// Type of media stream within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Subtitle => write!(f, "subtitle"),
        }
    }
}

// ---------------------------------------------------------------------------
// HwAccel
// ---------------------------------------------------------------------------

/// Hardware encoder families a node may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    /// Software encoding only.
    #[default]
    None,
    Nvenc,
    Qsv,
    Vaapi,
    VideoToolbox,
}

impl HwAccel {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Nvenc => write!(f, "nvenc"),
            Self::Qsv => write!(f, "qsv"),
            Self::Vaapi => write!(f, "vaapi"),
            Self::VideoToolbox => write!(f, "videotoolbox"),
        }
    }
}

impl FromStr for HwAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "software" | "" => Ok(Self::None),
            "nvenc" | "cuda" => Ok(Self::Nvenc),
            "qsv" => Ok(Self::Qsv),
            "vaapi" => Ok(Self::Vaapi),
            "videotoolbox" => Ok(Self::VideoToolbox),
            other => Err(format!("unknown hardware accelerator: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_display_and_serde() {
        assert_eq!(Container::Hls.to_string(), "hls");
        assert_eq!(Container::WebM.to_string(), "webm");
        let json = serde_json::to_string(&Container::Mkv).unwrap();
        assert_eq!(json, r#""mkv""#);
        let back: Container = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Container::Mkv);
        assert!(Container::Hls.is_segmented());
        assert!(!Container::Mp4.is_segmented());
    }

    #[test]
    fn video_codec_parse_aliases() {
        assert_eq!(VideoCodec::parse("hevc"), Some(VideoCodec::H265));
        assert_eq!(VideoCodec::parse("AVC"), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::parse("mpeg2video"), None);
    }

    #[test]
    fn audio_codec_serde() {
        let json = serde_json::to_string(&AudioCodec::TrueHd).unwrap();
        assert_eq!(json, r#""truehd""#);
        let back: AudioCodec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AudioCodec::TrueHd);
        assert_eq!(AudioCodec::parse("dca"), Some(AudioCodec::Dts));
    }

    #[test]
    fn audio_codecs_order_aac_first() {
        let mut codecs = vec![AudioCodec::Eac3, AudioCodec::Aac, AudioCodec::Ac3];
        codecs.sort();
        assert_eq!(codecs, vec![AudioCodec::Aac, AudioCodec::Ac3, AudioCodec::Eac3]);
    }

    #[test]
    fn subtitle_codec_text_vs_bitmap() {
        assert_eq!(SubtitleCodec::parse("subrip"), Some(SubtitleCodec::Srt));
        assert_eq!(SubtitleCodec::parse("hdmv_pgs_subtitle"), Some(SubtitleCodec::Pgs));
        assert!(SubtitleCodec::Ass.is_text());
        assert!(!SubtitleCodec::Pgs.is_text());
        assert_eq!(
            serde_json::to_string(&SubtitleCodec::MovText).unwrap(),
            r#""mov_text""#
        );
    }

    #[test]
    fn hdr_format_dynamic_range() {
        assert_eq!(HdrFormat::Sdr.dynamic_range(), DynamicRange::Sdr);
        assert_eq!(HdrFormat::Hdr10.dynamic_range(), DynamicRange::Pq);
        assert_eq!(HdrFormat::DolbyVision.dynamic_range(), DynamicRange::Pq);
        assert_eq!(HdrFormat::Hlg.dynamic_range(), DynamicRange::Hlg);
        assert!(!HdrFormat::Sdr.is_hdr());
        assert!(HdrFormat::Hdr10Plus.is_hdr());
    }

    #[test]
    fn dynamic_range_sorts_sdr_first() {
        let mut ranges = vec![DynamicRange::Pq, DynamicRange::Sdr, DynamicRange::Hlg];
        ranges.sort();
        assert_eq!(ranges[0], DynamicRange::Sdr);
        assert_eq!(DynamicRange::Pq.as_attribute(), "PQ");
    }

    #[test]
    fn hw_accel_from_str() {
        assert_eq!("cuda".parse::<HwAccel>().unwrap(), HwAccel::Nvenc);
        assert_eq!("VAAPI".parse::<HwAccel>().unwrap(), HwAccel::Vaapi);
        assert_eq!("none".parse::<HwAccel>().unwrap(), HwAccel::None);
        assert!("amf".parse::<HwAccel>().is_err());
        assert!(!HwAccel::None.is_hardware());
    }

    #[test]
    fn stream_type_serde_roundtrip() {
        let json = serde_json::to_string(&StreamType::Subtitle).unwrap();
        assert_eq!(json, r#""subtitle""#);
        let back: StreamType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StreamType::Subtitle);
    }
}
