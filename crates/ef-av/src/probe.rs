//! FFprobe-based [`MediaAnalyzer`] implementation.
//!
//! Shells out to `ffprobe -v quiet -print_format json -show_format
//! -show_streams -show_chapters` and maps the JSON into [`MediaInfo`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ef_core::{Error, HdrFormat, Result};
use ef_probe::{Attachment, AudioTrack, Chapter, MediaAnalyzer, MediaInfo, SubtitleTrack, VideoTrack};
use serde::Deserialize;

use crate::command::ToolCommand;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// An analyzer backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeAnalyzer {
    ffprobe_path: PathBuf,
}

impl FfprobeAnalyzer {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Analyzer using ffprobe from `PATH`.
    pub fn from_path() -> Option<Self> {
        which::which("ffprobe").ok().map(Self::new)
    }
}

#[async_trait]
impl MediaAnalyzer for FfprobeAnalyzer {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn analyze(&self, path: &Path) -> Result<MediaInfo> {
        if !path.exists() {
            return Err(Error::InputNotFound(path.to_path_buf()));
        }

        let output = ToolCommand::new(self.ffprobe_path.clone())
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-show_chapters",
            ])
            .path_arg(path)
            .timeout(PROBE_TIMEOUT)
            .execute()
            .await?;

        let info = parse_ffprobe_json(path, &output.stdout)?;
        tracing::debug!(
            path = %path.display(),
            video = info.video_tracks.len(),
            audio = info.audio_tracks.len(),
            subtitles = info.subtitle_tracks.len(),
            duration_secs = info.duration.map(|d| d.as_secs_f64()),
            "Analyzed media"
        );
        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    chapters: Vec<FfprobeChapter>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    bits_per_raw_sample: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
    color_transfer: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, u8>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeChapter {
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl FfprobeStream {
    fn flag(&self, name: &str) -> bool {
        self.disposition.get(name).copied() == Some(1)
    }

    /// Tag lookup ignoring case; Matroska writes `NUMBER_OF_FRAMES`, MP4 `language`.
    fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn language(&self) -> Option<String> {
        self.tag("language")
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("und"))
            .map(str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Map ffprobe JSON output into [`MediaInfo`].
pub fn parse_ffprobe_json(path: &Path, json: &str) -> Result<MediaInfo> {
    let output: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    let duration = output
        .format
        .duration
        .as_deref()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(Duration::from_secs_f64);

    let mut info = MediaInfo {
        file_path: path.to_path_buf(),
        file_size: output.format.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
        format_name: output.format.format_name.clone().unwrap_or_default(),
        duration,
        video_tracks: Vec::new(),
        audio_tracks: Vec::new(),
        subtitle_tracks: Vec::new(),
        attachments: Vec::new(),
        chapters: Vec::new(),
    };

    for stream in &output.streams {
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" if stream.flag("attached_pic") => info.attachments.push(attachment(stream)),
            "video" => info.video_tracks.push(VideoTrack {
                index: stream.index,
                codec: stream.codec_name.clone().unwrap_or_default(),
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
                frame_rate: stream
                    .r_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate)),
                frame_count: stream
                    .nb_frames
                    .as_deref()
                    .or_else(|| stream.tag("NUMBER_OF_FRAMES"))
                    .and_then(|s| s.parse().ok()),
                bit_depth: bit_depth(stream),
                hdr_format: detect_hdr(stream),
                default: stream.flag("default"),
                language: stream.language(),
            }),
            "audio" => info.audio_tracks.push(AudioTrack {
                index: stream.index,
                codec: stream.codec_name.clone().unwrap_or_default(),
                channels: stream.channels.unwrap_or(2),
                sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
                bitrate: stream
                    .bit_rate
                    .as_deref()
                    .or_else(|| stream.tag("BPS"))
                    .and_then(|s| s.parse().ok()),
                language: stream.language(),
                title: stream.tag("title").map(str::to_string),
                default: stream.flag("default"),
            }),
            "subtitle" => info.subtitle_tracks.push(SubtitleTrack {
                index: stream.index,
                codec: stream.codec_name.clone().unwrap_or_default(),
                language: stream.language(),
                title: stream.tag("title").map(str::to_string),
                forced: stream.flag("forced"),
                default: stream.flag("default"),
            }),
            "attachment" => info.attachments.push(attachment(stream)),
            _ => {}
        }
    }

    info.chapters = output
        .chapters
        .iter()
        .filter_map(|c| {
            let start = c.start_time.as_deref()?.parse::<f64>().ok()?;
            let end = c.end_time.as_deref()?.parse::<f64>().ok()?;
            (start >= 0.0 && end >= start).then(|| Chapter {
                start: Duration::from_secs_f64(start),
                end: Duration::from_secs_f64(end),
                title: c.tags.get("title").cloned(),
            })
        })
        .collect();

    Ok(info)
}

fn attachment(stream: &FfprobeStream) -> Attachment {
    Attachment {
        index: stream.index,
        filename: stream.tag("filename").map(str::to_string),
        mime_type: stream.tag("mimetype").map(str::to_string),
    }
}

fn detect_hdr(stream: &FfprobeStream) -> HdrFormat {
    for sd in &stream.side_data_list {
        match sd.side_data_type.as_deref() {
            Some("DOVI configuration record") => return HdrFormat::DolbyVision,
            Some(t) if t.contains("SMPTE2094-40") || t.contains("HDR10+") => return HdrFormat::Hdr10Plus,
            _ => {}
        }
    }
    match stream.color_transfer.as_deref() {
        Some("smpte2084") => HdrFormat::Hdr10,
        Some("arib-std-b67") => HdrFormat::Hlg,
        _ => HdrFormat::Sdr,
    }
}

fn bit_depth(stream: &FfprobeStream) -> Option<u8> {
    if let Some(bits) = stream.bits_per_raw_sample.as_deref().and_then(|s| s.parse().ok()) {
        return Some(bits);
    }
    let pix = stream.pix_fmt.as_deref()?;
    Some(if pix.contains("12") {
        12
    } else if pix.contains("10") {
        10
    } else {
        8
    })
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.parse().ok()?,
    };
    (fps > 0.0).then_some(fps)
}
