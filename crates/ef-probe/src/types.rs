//! Core types for media analysis results.

use std::path::PathBuf;
use std::time::Duration;

use ef_core::{AudioCodec, HdrFormat, SubtitleCodec, VideoCodec};
use serde::{Deserialize, Serialize};

/// Complete media file information extracted by analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Path to the analyzed file.
    pub file_path: PathBuf,
    /// File size in bytes.
    pub file_size: u64,
    /// Container format name as reported by the analyzer (e.g. "matroska,webm").
    pub format_name: String,
    /// Total duration (if determinable).
    pub duration: Option<Duration>,
    pub video_tracks: Vec<VideoTrack>,
    pub audio_tracks: Vec<AudioTrack>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
    /// Attached files (fonts for styled subtitles, cover art).
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl MediaInfo {
    /// Returns the primary video track.
    ///
    /// Prefers the first track marked as default; falls back to the first track.
    pub fn primary_video(&self) -> Option<&VideoTrack> {
        self.video_tracks
            .iter()
            .find(|t| t.default)
            .or_else(|| self.video_tracks.first())
    }

    /// Returns the primary audio track.
    ///
    /// Prefers the first track marked as default; falls back to the first track.
    pub fn primary_audio(&self) -> Option<&AudioTrack> {
        self.audio_tracks
            .iter()
            .find(|t| t.default)
            .or_else(|| self.audio_tracks.first())
    }

    /// Estimated number of frames in the primary video track.
    ///
    /// Uses the frame count declared by the container when present,
    /// otherwise `duration × frame_rate`.
    pub fn total_frames_estimate(&self) -> Option<u64> {
        let video = self.primary_video()?;
        if let Some(count) = video.frame_count.filter(|c| *c > 0) {
            return Some(count);
        }
        let fps = video.frame_rate.filter(|f| *f > 0.0)?;
        let secs = self.duration?.as_secs_f64();
        let frames = (secs * fps).round();
        (frames > 0.0).then_some(frames as u64)
    }

    /// Audio tracks selected by a language filter.
    ///
    /// An empty filter selects every track. With `default_only`, only the
    /// default track survives (or the first one when none is flagged).
    pub fn select_audio(&self, languages: &[String], default_only: bool) -> Vec<&AudioTrack> {
        let matching: Vec<&AudioTrack> = self
            .audio_tracks
            .iter()
            .filter(|t| language_matches(t.language.as_deref(), languages))
            .collect();
        if !default_only {
            return matching;
        }
        matching
            .iter()
            .find(|t| t.default)
            .or_else(|| matching.first())
            .map(|t| vec![*t])
            .unwrap_or_default()
    }

    /// Subtitle tracks selected by a language filter.
    ///
    /// Forced tracks are only selected when `include_forced` is set; they are
    /// still subject to the language filter.
    pub fn select_subtitles(&self, languages: &[String], include_forced: bool) -> Vec<&SubtitleTrack> {
        self.subtitle_tracks
            .iter()
            .filter(|t| include_forced || !t.forced)
            .filter(|t| language_matches(t.language.as_deref(), languages))
            .collect()
    }

    /// Attachments that look like fonts.
    pub fn font_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_font())
    }
}

/// Case-insensitive language filter. An empty filter matches everything,
/// an untagged track only matches an empty filter or an explicit `und`.
pub fn language_matches(language: Option<&str>, filter: &[String]) -> bool {
    if filter.is_empty() {
        return true;
    }
    let lang = language.unwrap_or("und");
    filter.iter().any(|f| f.eq_ignore_ascii_case(lang))
}

/// A video track within a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTrack {
    /// Absolute stream index in the source file.
    pub index: u32,
    /// Codec name as reported by the analyzer (e.g. "hevc").
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Frame rate in frames per second.
    pub frame_rate: Option<f64>,
    /// Frame count declared by the container.
    pub frame_count: Option<u64>,
    /// Bit depth (8, 10, 12).
    pub bit_depth: Option<u8>,
    pub hdr_format: HdrFormat,
    pub default: bool,
    pub language: Option<String>,
}

impl VideoTrack {
    pub fn video_codec(&self) -> Option<VideoCodec> {
        VideoCodec::parse(&self.codec)
    }
}

/// An audio track within a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Absolute stream index in the source file.
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Average bitrate in bits per second.
    pub bitrate: Option<u64>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub default: bool,
}

impl AudioTrack {
    pub fn audio_codec(&self) -> Option<AudioCodec> {
        AudioCodec::parse(&self.codec)
    }
}

/// A subtitle track within a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// Absolute stream index in the source file.
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub forced: bool,
    pub default: bool,
}

impl SubtitleTrack {
    pub fn subtitle_codec(&self) -> Option<SubtitleCodec> {
        SubtitleCodec::parse(&self.codec)
    }

    /// Bitmap subtitles cannot be converted to text formats.
    pub fn is_text(&self) -> bool {
        self.subtitle_codec().is_some_and(|c| c.is_text())
    }
}

/// A file attached to the container (Matroska attachments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub index: u32,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
}

impl Attachment {
    pub fn is_font(&self) -> bool {
        let by_mime = self.mime_type.as_deref().is_some_and(|m| {
            let m = m.to_ascii_lowercase();
            m.contains("font") || m.contains("truetype") || m.contains("opentype")
        });
        let by_name = self.filename.as_deref().is_some_and(|f| {
            let f = f.to_ascii_lowercase();
            f.ends_with(".ttf") || f.ends_with(".otf") || f.ends_with(".ttc")
        });
        by_mime || by_name
    }
}

/// A chapter marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start: Duration,
    pub end: Duration,
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn primary_video_prefers_default() {
        let mut info = fixtures::sdr_1080p(Duration::from_secs(120));
        let mut second = info.video_tracks[0].clone();
        second.index = 5;
        second.width = 3840;
        second.height = 2160;
        second.default = true;
        info.video_tracks[0].default = false;
        info.video_tracks.push(second);

        let primary = info.primary_video().unwrap();
        assert_eq!(primary.width, 3840);
    }

    #[test]
    fn primary_video_empty() {
        let mut info = fixtures::sdr_1080p(Duration::from_secs(10));
        info.video_tracks.clear();
        assert!(info.primary_video().is_none());
        assert!(info.total_frames_estimate().is_none());
    }

    #[test]
    fn frames_estimate_from_duration() {
        let info = fixtures::sdr_1080p(Duration::from_secs(120));
        // 120 s at 23.976 fps
        assert_eq!(info.total_frames_estimate(), Some(2877));
    }

    #[test]
    fn frames_estimate_prefers_declared_count() {
        let mut info = fixtures::sdr_1080p(Duration::from_secs(120));
        info.video_tracks[0].frame_count = Some(2880);
        assert_eq!(info.total_frames_estimate(), Some(2880));
    }

    #[test]
    fn select_audio_language_filter() {
        let info = fixtures::multi_track(Duration::from_secs(60));
        assert_eq!(info.select_audio(&[], false).len(), 3);

        let eng = info.select_audio(&["ENG".to_string()], false);
        assert_eq!(eng.len(), 2);
        assert!(eng.iter().all(|t| t.language.as_deref() == Some("eng")));
    }

    #[test]
    fn select_audio_default_only() {
        let info = fixtures::multi_track(Duration::from_secs(60));
        let picked = info.select_audio(&[], true);
        assert_eq!(picked.len(), 1);
        assert!(picked[0].default);

        // No default among German tracks: first German track wins.
        let picked = info.select_audio(&["ger".to_string()], true);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].language.as_deref(), Some("ger"));
    }

    #[test]
    fn select_subtitles_forced_flag() {
        let info = fixtures::multi_track(Duration::from_secs(60));
        assert_eq!(info.select_subtitles(&[], false).len(), 2);
        assert_eq!(info.select_subtitles(&[], true).len(), 3);
        assert_eq!(info.select_subtitles(&["eng".to_string()], true).len(), 2);
    }

    #[test]
    fn untagged_language_only_matches_und() {
        assert!(language_matches(None, &[]));
        assert!(!language_matches(None, &["eng".to_string()]));
        assert!(language_matches(None, &["und".to_string()]));
    }

    #[test]
    fn font_attachments_detected() {
        let info = fixtures::multi_track(Duration::from_secs(60));
        let fonts: Vec<_> = info.font_attachments().collect();
        assert_eq!(fonts.len(), 1);
        assert_eq!(fonts[0].filename.as_deref(), Some("OpenSans.ttf"));
    }

    #[test]
    fn codec_helpers() {
        let info = fixtures::multi_track(Duration::from_secs(60));
        assert_eq!(info.video_tracks[0].video_codec(), Some(VideoCodec::H265));
        assert_eq!(info.audio_tracks[0].audio_codec(), Some(AudioCodec::TrueHd));
        assert!(info.subtitle_tracks[0].is_text());
        assert!(!info.subtitle_tracks[2].is_text());
    }

    #[test]
    fn serde_roundtrip() {
        let info = fixtures::multi_track(Duration::from_secs(60));
        let json = serde_json::to_string(&info).unwrap();
        let back: MediaInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
