//! Container formats, their codec compatibility and muxer arguments.

use std::path::Path;

use ef_core::{AudioCodec, Container, SubtitleCodec, VideoCodec};
use serde::{Deserialize, Serialize};

/// Segment payload format for HLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    #[default]
    Fmp4,
    MpegTs,
}

/// HLS packaging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsSettings {
    /// Target segment duration in seconds.
    pub segment_duration: u32,
    pub segment_type: SegmentType,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_duration: 6,
            segment_type: SegmentType::Fmp4,
        }
    }
}

/// MP4 muxer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mp4Settings {
    /// Move the index to the front for progressive playback.
    pub faststart: bool,
}

impl Default for Mp4Settings {
    fn default() -> Self {
        Self { faststart: true }
    }
}

/// An output container together with its muxer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ContainerConfig {
    Hls(HlsSettings),
    Mp4(Mp4Settings),
    Mkv,
    WebM,
}

/// Name of the per-variant media playlist for segmented outputs.
pub const MEDIA_PLAYLIST_NAME: &str = "index.m3u8";

impl ContainerConfig {
    pub fn format(&self) -> Container {
        match self {
            Self::Hls(_) => Container::Hls,
            Self::Mp4(_) => Container::Mp4,
            Self::Mkv => Container::Mkv,
            Self::WebM => Container::WebM,
        }
    }

    pub fn is_segmented(&self) -> bool {
        self.format().is_segmented()
    }

    pub fn supports_video(&self, codec: VideoCodec) -> bool {
        use VideoCodec::*;
        match self {
            Self::Hls(h) => match h.segment_type {
                SegmentType::Fmp4 => matches!(codec, H264 | H265 | Av1),
                SegmentType::MpegTs => matches!(codec, H264 | H265),
            },
            Self::Mp4(_) | Self::Mkv => true,
            Self::WebM => matches!(codec, Vp9 | Av1),
        }
    }

    pub fn supports_audio(&self, codec: AudioCodec) -> bool {
        use AudioCodec::*;
        match self {
            Self::Hls(h) => match h.segment_type {
                SegmentType::Fmp4 => matches!(codec, Aac | Ac3 | Eac3 | Flac | Opus),
                SegmentType::MpegTs => matches!(codec, Aac | Ac3 | Eac3),
            },
            Self::Mp4(_) => matches!(codec, Aac | Ac3 | Eac3 | Opus | Flac),
            Self::Mkv => true,
            Self::WebM => matches!(codec, Opus),
        }
    }

    /// Whether a subtitle format can be carried as a separate stream.
    pub fn supports_subtitle(&self, codec: SubtitleCodec) -> bool {
        use SubtitleCodec::*;
        match self {
            Self::Hls(_) | Self::WebM => matches!(codec, WebVtt),
            Self::Mp4(_) => matches!(codec, MovText),
            Self::Mkv => matches!(codec, Srt | Ass | WebVtt),
        }
    }

    /// File name of the primary artifact inside a variant directory.
    pub fn primary_file_name(&self, stem: &str) -> String {
        match self {
            Self::Hls(_) => MEDIA_PLAYLIST_NAME.to_string(),
            other => format!("{stem}.{}", other.format().extension()),
        }
    }

    /// Muxer arguments placed right before the output path.
    ///
    /// For segmented containers `variant_dir` receives the segments and the
    /// media playlist.
    pub fn muxer_args(&self, variant_dir: &Path) -> Vec<String> {
        match self {
            Self::Hls(h) => {
                let mut args = vec![
                    "-f".to_string(),
                    "hls".to_string(),
                    "-hls_time".to_string(),
                    h.segment_duration.to_string(),
                    "-hls_playlist_type".to_string(),
                    "vod".to_string(),
                    "-hls_flags".to_string(),
                    "independent_segments".to_string(),
                ];
                let pattern = match h.segment_type {
                    SegmentType::Fmp4 => {
                        args.extend([
                            "-hls_segment_type".to_string(),
                            "fmp4".to_string(),
                            "-hls_fmp4_init_filename".to_string(),
                            "init.mp4".to_string(),
                        ]);
                        "seg_%05d.m4s"
                    }
                    SegmentType::MpegTs => {
                        args.extend(["-hls_segment_type".to_string(), "mpegts".to_string()]);
                        "seg_%05d.ts"
                    }
                };
                args.push("-hls_segment_filename".to_string());
                args.push(variant_dir.join(pattern).to_string_lossy().into_owned());
                args
            }
            Self::Mp4(m) => {
                let mut args = vec!["-f".to_string(), "mp4".to_string()];
                if m.faststart {
                    args.extend(["-movflags".to_string(), "+faststart".to_string()]);
                }
                args
            }
            Self::Mkv => vec!["-f".to_string(), "matroska".to_string()],
            Self::WebM => vec!["-f".to_string(), "webm".to_string()],
        }
    }

    /// Target segment duration, for segmented containers.
    pub fn segment_duration(&self) -> Option<u32> {
        match self {
            Self::Hls(h) => Some(h.segment_duration),
            _ => None,
        }
    }
}
