//! Canned [`MediaInfo`] values and an analyzer that returns them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ef_core::{HdrFormat, Result};

use crate::analyzer::MediaAnalyzer;
use crate::types::{Attachment, AudioTrack, MediaInfo, SubtitleTrack, VideoTrack};

/// 1080p SDR H.264 source with a single English AAC stereo track.
pub fn sdr_1080p(duration: Duration) -> MediaInfo {
    MediaInfo {
        file_path: PathBuf::from("/media/source.mkv"),
        file_size: 1_500_000_000,
        format_name: "matroska,webm".into(),
        duration: Some(duration),
        video_tracks: vec![VideoTrack {
            index: 0,
            codec: "h264".into(),
            width: 1920,
            height: 1080,
            frame_rate: Some(23.976),
            frame_count: None,
            bit_depth: Some(8),
            hdr_format: HdrFormat::Sdr,
            default: true,
            language: None,
        }],
        audio_tracks: vec![AudioTrack {
            index: 1,
            codec: "aac".into(),
            channels: 2,
            sample_rate: Some(48_000),
            bitrate: Some(192_000),
            language: Some("eng".into()),
            title: None,
            default: true,
        }],
        subtitle_tracks: vec![],
        attachments: vec![],
        chapters: vec![],
    }
}

/// 2160p HDR10 HEVC source with several audio and subtitle tracks and an
/// embedded font.
pub fn multi_track(duration: Duration) -> MediaInfo {
    MediaInfo {
        file_path: PathBuf::from("/media/remux.mkv"),
        file_size: 60_000_000_000,
        format_name: "matroska,webm".into(),
        duration: Some(duration),
        video_tracks: vec![VideoTrack {
            index: 0,
            codec: "hevc".into(),
            width: 3840,
            height: 2160,
            frame_rate: Some(23.976),
            frame_count: None,
            bit_depth: Some(10),
            hdr_format: HdrFormat::Hdr10,
            default: true,
            language: None,
        }],
        audio_tracks: vec![
            audio(1, "truehd", 8, "eng", true),
            audio(2, "ac3", 6, "eng", false),
            audio(3, "ac3", 6, "ger", false),
        ],
        subtitle_tracks: vec![
            subtitle(4, "subrip", "eng", false),
            subtitle(5, "ass", "eng", true),
            subtitle(6, "hdmv_pgs_subtitle", "ger", false),
        ],
        attachments: vec![
            Attachment {
                index: 7,
                filename: Some("OpenSans.ttf".into()),
                mime_type: Some("application/x-truetype-font".into()),
            },
            Attachment {
                index: 8,
                filename: Some("cover.jpg".into()),
                mime_type: Some("image/jpeg".into()),
            },
        ],
        chapters: vec![],
    }
}

fn audio(index: u32, codec: &str, channels: u32, lang: &str, default: bool) -> AudioTrack {
    AudioTrack {
        index,
        codec: codec.into(),
        channels,
        sample_rate: Some(48_000),
        bitrate: None,
        language: Some(lang.into()),
        title: None,
        default,
    }
}

fn subtitle(index: u32, codec: &str, lang: &str, forced: bool) -> SubtitleTrack {
    SubtitleTrack {
        index,
        codec: codec.into(),
        language: Some(lang.into()),
        title: None,
        forced,
        default: false,
    }
}

/// Analyzer that returns a fixed [`MediaInfo`] for any path.
pub struct StaticAnalyzer {
    info: MediaInfo,
}

impl StaticAnalyzer {
    pub fn new(info: MediaInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl MediaAnalyzer for StaticAnalyzer {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn analyze(&self, path: &Path) -> Result<MediaInfo> {
        let mut info = self.info.clone();
        info.file_path = path.to_path_buf();
        Ok(info)
    }
}
