//! Encoding profile model.
//!
//! A profile fully determines the outputs of a job: container, one entry per
//! video rendition, audio and subtitle selections, and global options. Jobs
//! hold their own clone, so edits to a stored profile never reach a job that
//! is already running.

use std::collections::HashSet;

use ef_core::{Error, HwAccel, ProfileId, Result, SubtitleCodec};
use serde::{Deserialize, Serialize};

use crate::codec::{AudioCodecConfig, RateControl, VideoCodecConfig};
use crate::container::ContainerConfig;

/// How a video output is fitted to its target dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Keep aspect ratio, fit inside the box.
    #[default]
    Fit,
    /// Keep aspect ratio, fill the box and crop the overflow.
    Fill,
    /// Ignore aspect ratio.
    Stretch,
}

/// One video rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOutput {
    /// Label used for task names and output directories (e.g. "1080p").
    pub name: String,
    #[serde(flatten)]
    pub codec: VideoCodecConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub scale_mode: ScaleMode,
    /// Tone-map HDR sources down to SDR.
    #[serde(default)]
    pub tone_map: bool,
    /// Extra video filters appended after scaling/tone-mapping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    /// Drop this output when the source is smaller than the target.
    #[serde(default = "default_true")]
    pub skip_if_lower_resolution: bool,
    /// Arguments appended after every generated option for this output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl VideoOutput {
    /// Whether encoding this output from a `src_w`×`src_h` source would upscale.
    pub fn would_upscale(&self, src_w: u32, src_h: u32) -> bool {
        self.width.is_some_and(|w| w > src_w) || self.height.is_some_and(|h| h > src_h)
    }
}

/// One audio output, applied to every source track the filter selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOutput {
    #[serde(flatten)]
    pub codec: AudioCodecConfig,
    /// ISO 639-2 languages; empty selects every track.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    /// Only encode the source's default track.
    #[serde(default)]
    pub default_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// One subtitle output, applied to every source track the filter selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleOutput {
    pub codec: SubtitleCodec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    /// Also select tracks flagged as forced.
    #[serde(default)]
    pub include_forced: bool,
    /// Render into the video instead of producing a separate stream.
    #[serde(default)]
    pub burn_in: bool,
}

/// Hardware acceleration policy for video outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelPreference {
    /// Always encode in software.
    Software,
    /// Use whatever accelerator the executing node has.
    #[default]
    Auto,
    /// Prefer nodes with this accelerator; fall back to software after the
    /// dispatcher's bounded wait.
    Prefer(HwAccel),
}

impl HwAccelPreference {
    /// The accelerator a task needs from its node, if any.
    pub fn required(&self) -> Option<HwAccel> {
        match self {
            Self::Prefer(hw) if hw.is_hardware() => Some(*hw),
            _ => None,
        }
    }
}

/// Options that apply to the whole job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingOptions {
    pub hw_accel: HwAccelPreference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    pub two_pass: bool,
    /// Upper bound on this job's tasks running at the same time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<u32>,
}

/// A named, serializable bundle of output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingProfile {
    #[serde(default)]
    pub id: ProfileId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Built-in profiles cannot be saved over or deleted.
    #[serde(default)]
    pub system: bool,
    pub container: ContainerConfig,
    #[serde(default)]
    pub video: Vec<VideoOutput>,
    #[serde(default)]
    pub audio: Vec<AudioOutput>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleOutput>,
    #[serde(default)]
    pub options: EncodingOptions,
    /// Appended to every invocation after all generated options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_args: Vec<String>,
}

impl EncodingProfile {
    /// Every problem with this profile, in a stable order.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let container = self.container.format();

        if self.name.trim().is_empty() {
            problems.push("profile name is empty".to_string());
        }
        if self.video.is_empty() && self.audio.is_empty() {
            problems.push("profile must define at least one video or audio output".to_string());
        } else if self.video.is_empty() && self.container.is_segmented() {
            problems.push(format!(
                "{container} needs at least one video output for its master playlist"
            ));
        }

        let mut names = HashSet::new();
        for (i, v) in self.video.iter().enumerate() {
            let label = if v.name.is_empty() {
                problems.push(format!("video output #{i} has no name"));
                format!("#{i}")
            } else {
                v.name.clone()
            };
            if !v.name.is_empty() && !names.insert(v.name.as_str()) {
                problems.push(format!("duplicate video output name '{}'", v.name));
            }
            if !self.container.supports_video(v.codec.kind()) {
                problems.push(format!(
                    "video output '{label}': {} is not supported in {container}",
                    v.codec.kind()
                ));
            }
            for (dim, value) in [("width", v.width), ("height", v.height)] {
                match value {
                    Some(0) => problems.push(format!("video output '{label}': {dim} is 0")),
                    Some(n) if n % 2 != 0 => {
                        problems.push(format!("video output '{label}': {dim} {n} is not even"))
                    }
                    _ => {}
                }
            }
            if v.codec.settings().keyframe_interval.is_some_and(|k| k <= 0.0) {
                problems.push(format!(
                    "video output '{label}': keyframe interval must be positive"
                ));
            }
            if self.options.two_pass
                && !matches!(v.codec.settings().rate_control, Some(RateControl::Bitrate { .. }))
            {
                problems.push(format!(
                    "video output '{label}': two-pass encoding requires bitrate rate control"
                ));
            }
        }

        for (i, a) in self.audio.iter().enumerate() {
            let kind = a.codec.kind();
            if !self.container.supports_audio(kind) {
                problems.push(format!(
                    "audio output #{i}: {kind} is not supported in {container}"
                ));
            }
            if matches!(a.codec, AudioCodecConfig::Flac(_)) && a.codec.settings().bitrate_kbps.is_some() {
                problems.push(format!("audio output #{i}: flac is lossless; bitrate does not apply"));
            }
            if a.codec.settings().channels == Some(0) {
                problems.push(format!("audio output #{i}: channels is 0"));
            }
        }

        for (i, s) in self.subtitles.iter().enumerate() {
            if s.burn_in {
                if self.video.is_empty() {
                    problems.push(format!(
                        "subtitle output #{i}: burn-in requires a video output"
                    ));
                }
            } else if !self.container.supports_subtitle(s.codec) {
                problems.push(format!(
                    "subtitle output #{i}: {} is not supported in {container}",
                    s.codec
                ));
            }
        }

        if self.options.max_concurrent_jobs == Some(0) {
            problems.push("options.max_concurrent_jobs is 0".to_string());
        }
        if self.options.threads == Some(0) {
            problems.push("options.threads is 0".to_string());
        }

        problems
    }

    /// Validate the profile, joining every problem into one error.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(problems.join("; ")))
        }
    }

    /// Subtitle outputs rendered into the video.
    pub fn burn_in_subtitles(&self) -> impl Iterator<Item = &SubtitleOutput> {
        self.subtitles.iter().filter(|s| s.burn_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioEncoderSettings, VideoEncoderSettings};
    use crate::container::{HlsSettings, Mp4Settings};
    use assert_matches::assert_matches;

    fn video(name: &str, codec: VideoCodecConfig, height: u32) -> VideoOutput {
        VideoOutput {
            name: name.into(),
            codec,
            width: None,
            height: Some(height),
            scale_mode: ScaleMode::Fit,
            tone_map: false,
            filters: vec![],
            skip_if_lower_resolution: true,
            extra_args: vec![],
        }
    }

    fn aac() -> AudioOutput {
        AudioOutput {
            codec: AudioCodecConfig::Aac(AudioEncoderSettings {
                bitrate_kbps: Some(128),
                channels: Some(2),
                sample_rate: None,
            }),
            languages: vec![],
            default_only: false,
            extra_args: vec![],
        }
    }

    fn hls_profile() -> EncodingProfile {
        EncodingProfile {
            id: ProfileId::new(),
            name: "test".into(),
            description: String::new(),
            system: false,
            container: ContainerConfig::Hls(HlsSettings::default()),
            video: vec![video(
                "1080p",
                VideoCodecConfig::H264(VideoEncoderSettings::default()),
                1080,
            )],
            audio: vec![aac()],
            subtitles: vec![],
            options: EncodingOptions::default(),
            custom_args: vec![],
        }
    }

    #[test]
    fn valid_profile_has_no_problems() {
        assert!(hls_profile().validate().is_ok());
    }

    #[test]
    fn requires_video_or_audio() {
        let mut p = hls_profile();
        p.video.clear();
        p.audio.clear();
        let problems = p.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("at least one"));
    }

    #[test]
    fn audio_only_profile_needs_single_file_container() {
        let mut p = hls_profile();
        p.video.clear();
        let problems = p.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("hls needs at least one video output"));

        p.container = ContainerConfig::Mp4(Mp4Settings::default());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn incompatible_codec_rejected() {
        let mut p = hls_profile();
        p.container = ContainerConfig::WebM;
        let err = p.validate().unwrap_err();
        assert_matches!(err, Error::Validation(msg) => {
            assert!(msg.contains("h264 is not supported in webm"));
            assert!(msg.contains("aac is not supported in webm"));
        });
    }

    #[test]
    fn odd_dimensions_and_duplicate_names() {
        let mut p = hls_profile();
        p.video.push(video(
            "1080p",
            VideoCodecConfig::H264(VideoEncoderSettings::default()),
            721,
        ));
        let problems = p.problems();
        assert!(problems.iter().any(|m| m.contains("duplicate video output name")));
        assert!(problems.iter().any(|m| m.contains("721 is not even")));
    }

    #[test]
    fn two_pass_requires_bitrate() {
        let mut p = hls_profile();
        p.options.two_pass = true;
        assert!(p.problems().iter().any(|m| m.contains("two-pass")));

        p.video[0].codec = VideoCodecConfig::H264(VideoEncoderSettings {
            rate_control: Some(RateControl::Bitrate {
                kbps: 5000,
                max_kbps: None,
                buffer_kbps: None,
            }),
            ..Default::default()
        });
        assert!(p.validate().is_ok());
    }

    #[test]
    fn subtitle_checks() {
        let mut p = hls_profile();
        p.subtitles.push(SubtitleOutput {
            codec: SubtitleCodec::Srt,
            languages: vec![],
            include_forced: false,
            burn_in: false,
        });
        assert!(p.problems()[0].contains("srt is not supported in hls"));

        p.subtitles[0].burn_in = true;
        assert!(p.validate().is_ok());
        assert_eq!(p.burn_in_subtitles().count(), 1);

        p.video.clear();
        assert!(p
            .problems()
            .iter()
            .any(|m| m.contains("burn-in requires a video output")));
    }

    #[test]
    fn upscale_detection() {
        let v = video("2160p", VideoCodecConfig::H265(VideoEncoderSettings::default()), 2160);
        assert!(v.would_upscale(1920, 1080));
        assert!(!v.would_upscale(3840, 2160));
    }

    #[test]
    fn hw_preference_required() {
        assert_eq!(HwAccelPreference::Auto.required(), None);
        assert_eq!(HwAccelPreference::Prefer(HwAccel::Nvenc).required(), Some(HwAccel::Nvenc));
        assert_eq!(HwAccelPreference::Prefer(HwAccel::None).required(), None);
    }

    #[test]
    fn profile_json_roundtrip() {
        let mut p = hls_profile();
        p.container = ContainerConfig::Mp4(Mp4Settings::default());
        p.options.hw_accel = HwAccelPreference::Prefer(HwAccel::Qsv);
        let json = serde_json::to_string_pretty(&p).unwrap();
        assert!(json.contains(r#""codec": "h264""#));
        let back: EncodingProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
