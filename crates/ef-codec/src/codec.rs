//! Video and audio codec configurations.

use ef_core::{AudioCodec, HwAccel, SubtitleCodec, VideoCodec};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Rate control
// ---------------------------------------------------------------------------

/// How the encoder allocates bits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RateControl {
    /// Constant quality. Mapped to the accelerator's quality knob on hardware.
    Crf { value: u8 },
    /// Target bitrate with optional VBV constraints.
    Bitrate {
        kbps: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_kbps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buffer_kbps: Option<u32>,
    },
}

// ---------------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------------

/// Encoder parameters shared by every video codec kind. Unset fields are
/// left out of the command line entirely.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoEncoderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_control: Option<RateControl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tune: Option<String>,
    /// Codec level, e.g. "4.1".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_format: Option<String>,
    /// Keyframe interval in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyframe_interval: Option<f64>,
}

/// A video codec together with its encoder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum VideoCodecConfig {
    H264(VideoEncoderSettings),
    H265(VideoEncoderSettings),
    Av1(VideoEncoderSettings),
    Vp9(VideoEncoderSettings),
}

impl VideoCodecConfig {
    pub fn kind(&self) -> VideoCodec {
        match self {
            Self::H264(_) => VideoCodec::H264,
            Self::H265(_) => VideoCodec::H265,
            Self::Av1(_) => VideoCodec::Av1,
            Self::Vp9(_) => VideoCodec::Vp9,
        }
    }

    pub fn settings(&self) -> &VideoEncoderSettings {
        match self {
            Self::H264(s) | Self::H265(s) | Self::Av1(s) | Self::Vp9(s) => s,
        }
    }

    /// ffmpeg encoder name for an accelerator, if that accelerator can
    /// encode this codec at all.
    pub fn encoder_for(&self, hw: HwAccel) -> Option<&'static str> {
        use HwAccel::*;
        let name = match (self.kind(), hw) {
            (VideoCodec::H264, None) => "libx264",
            (VideoCodec::H264, Nvenc) => "h264_nvenc",
            (VideoCodec::H264, Qsv) => "h264_qsv",
            (VideoCodec::H264, Vaapi) => "h264_vaapi",
            (VideoCodec::H264, VideoToolbox) => "h264_videotoolbox",
            (VideoCodec::H265, None) => "libx265",
            (VideoCodec::H265, Nvenc) => "hevc_nvenc",
            (VideoCodec::H265, Qsv) => "hevc_qsv",
            (VideoCodec::H265, Vaapi) => "hevc_vaapi",
            (VideoCodec::H265, VideoToolbox) => "hevc_videotoolbox",
            (VideoCodec::Av1, None) => "libsvtav1",
            (VideoCodec::Av1, Nvenc) => "av1_nvenc",
            (VideoCodec::Av1, Qsv) => "av1_qsv",
            (VideoCodec::Av1, Vaapi) => "av1_vaapi",
            (VideoCodec::Vp9, None) => "libvpx-vp9",
            (VideoCodec::Vp9, Qsv) => "vp9_qsv",
            (VideoCodec::Vp9, Vaapi) => "vp9_vaapi",
            _ => return Option::None,
        };
        Some(name)
    }

    /// Encoder selection with software fallback.
    ///
    /// Returns the accelerator actually used and the encoder name.
    pub fn resolve_encoder(&self, hw: HwAccel) -> (HwAccel, &'static str) {
        match self.encoder_for(hw) {
            Some(enc) => (hw, enc),
            None => (
                HwAccel::None,
                self.encoder_for(HwAccel::None).unwrap_or("libx264"),
            ),
        }
    }

    /// Command fragment for this output stream: encoder, rate control and
    /// every explicitly configured option.
    pub fn args(&self, hw: HwAccel) -> Vec<String> {
        let (hw, encoder) = self.resolve_encoder(hw);
        let s = self.settings();
        let mut args = vec!["-c:v".to_string(), encoder.to_string()];

        match &s.rate_control {
            Some(RateControl::Crf { value }) => {
                let knob = match hw {
                    HwAccel::None => "-crf",
                    HwAccel::Nvenc => "-cq",
                    HwAccel::Qsv => "-global_quality",
                    HwAccel::Vaapi => "-qp",
                    HwAccel::VideoToolbox => "-q:v",
                };
                args.push(knob.to_string());
                args.push(value.to_string());
                // libvpx only honours CRF in constrained-quality mode with b:v 0.
                if self.kind() == VideoCodec::Vp9 && hw == HwAccel::None {
                    args.extend(["-b:v".to_string(), "0".to_string()]);
                }
            }
            Some(RateControl::Bitrate {
                kbps,
                max_kbps,
                buffer_kbps,
            }) => {
                args.push("-b:v".to_string());
                args.push(format!("{kbps}k"));
                if let Some(max) = max_kbps {
                    args.push("-maxrate".to_string());
                    args.push(format!("{max}k"));
                }
                if let Some(buf) = buffer_kbps {
                    args.push("-bufsize".to_string());
                    args.push(format!("{buf}k"));
                }
            }
            None => {}
        }

        push_opt(&mut args, "-preset", s.preset.as_deref());
        push_opt(&mut args, "-profile:v", s.profile.as_deref());
        push_opt(&mut args, "-tune", s.tune.as_deref());
        push_opt(&mut args, "-level:v", s.level.as_deref());
        push_opt(&mut args, "-pix_fmt", s.pixel_format.as_deref());
        if let Some(interval) = s.keyframe_interval {
            args.push("-force_key_frames".to_string());
            args.push(format!("expr:gte(t,n_forced*{})", trim_float(interval)));
        }
        args
    }

    /// Target bitrate in bits per second, when the profile specifies one.
    pub fn target_bitrate(&self) -> Option<u64> {
        match self.settings().rate_control {
            Some(RateControl::Bitrate { kbps, max_kbps, .. }) => {
                Some(u64::from(max_kbps.unwrap_or(kbps)) * 1000)
            }
            _ => None,
        }
    }

    /// RFC 6381 codec string for the `CODECS` playlist attribute.
    pub fn codec_string(&self, width: u32, height: u32, bit_depth: u8) -> String {
        let s = self.settings();
        let explicit_level = s.level.as_deref().and_then(parse_level);
        let profile = s.profile.as_deref().map(str::to_ascii_lowercase);
        let ten_bit = bit_depth >= 10
            || profile.as_deref().is_some_and(|p| p.contains("10"))
            || s.pixel_format.as_deref().is_some_and(|p| p.contains("10"));
        let pixels = height.max(width * 9 / 16);

        match self.kind() {
            VideoCodec::H264 => {
                let (profile_idc, constraints) = match profile.as_deref() {
                    Some("baseline") | Some("constrained_baseline") => (0x42, 0xE0),
                    Some("main") => (0x4D, 0x40),
                    Some("high10") => (0x6E, 0x00),
                    _ if ten_bit => (0x6E, 0x00),
                    _ => (0x64, 0x00),
                };
                let level = explicit_level
                    .map(|(major, minor)| major * 10 + minor)
                    .unwrap_or(match pixels {
                        0..=480 => 30,
                        481..=720 => 31,
                        721..=1080 => 40,
                        1081..=1440 => 50,
                        _ => 51,
                    });
                format!("avc1.{profile_idc:02x}{constraints:02x}{level:02x}")
            }
            VideoCodec::H265 => {
                let level = explicit_level
                    .map(|(major, minor)| major * 30 + minor * 3)
                    .unwrap_or(match pixels {
                        0..=720 => 93,
                        721..=1080 => 120,
                        1081..=2160 => 150,
                        _ => 180,
                    });
                if ten_bit {
                    format!("hvc1.2.4.L{level}.B0")
                } else {
                    format!("hvc1.1.6.L{level}.B0")
                }
            }
            VideoCodec::Av1 => {
                let seq_level = explicit_level
                    .map(|(major, minor)| (major.saturating_sub(2)) * 4 + minor)
                    .unwrap_or(match pixels {
                        0..=720 => 5,
                        721..=1080 => 8,
                        1081..=2160 => 12,
                        _ => 16,
                    });
                let depth = if ten_bit { 10 } else { 8 };
                format!("av01.0.{seq_level:02}M.{depth:02}")
            }
            VideoCodec::Vp9 => {
                let level = explicit_level
                    .map(|(major, minor)| major * 10 + minor)
                    .unwrap_or(match pixels {
                        0..=720 => 31,
                        721..=1080 => 40,
                        1081..=2160 => 50,
                        _ => 60,
                    });
                let (profile, depth) = if ten_bit { (2, 10) } else { (0, 8) };
                format!("vp09.{profile:02}.{level:02}.{depth:02}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Audio encoder parameters. Unset fields keep the source's values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEncoderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

/// An audio codec together with its encoder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum AudioCodecConfig {
    Aac(AudioEncoderSettings),
    Ac3(AudioEncoderSettings),
    Eac3(AudioEncoderSettings),
    Opus(AudioEncoderSettings),
    Flac(AudioEncoderSettings),
}

impl AudioCodecConfig {
    pub fn kind(&self) -> AudioCodec {
        match self {
            Self::Aac(_) => AudioCodec::Aac,
            Self::Ac3(_) => AudioCodec::Ac3,
            Self::Eac3(_) => AudioCodec::Eac3,
            Self::Opus(_) => AudioCodec::Opus,
            Self::Flac(_) => AudioCodec::Flac,
        }
    }

    pub fn settings(&self) -> &AudioEncoderSettings {
        match self {
            Self::Aac(s) | Self::Ac3(s) | Self::Eac3(s) | Self::Opus(s) | Self::Flac(s) => s,
        }
    }

    pub fn encoder(&self) -> &'static str {
        match self {
            Self::Aac(_) => "aac",
            Self::Ac3(_) => "ac3",
            Self::Eac3(_) => "eac3",
            Self::Opus(_) => "libopus",
            Self::Flac(_) => "flac",
        }
    }

    /// Command fragment for this output stream.
    pub fn args(&self) -> Vec<String> {
        let s = self.settings();
        let mut args = vec!["-c:a".to_string(), self.encoder().to_string()];
        if let Some(kbps) = s.bitrate_kbps {
            args.push("-b:a".to_string());
            args.push(format!("{kbps}k"));
        }
        if let Some(ch) = s.channels {
            args.push("-ac".to_string());
            args.push(ch.to_string());
        }
        if let Some(rate) = s.sample_rate {
            args.push("-ar".to_string());
            args.push(rate.to_string());
        }
        args
    }

    /// Target bitrate in bits per second, when the profile specifies one.
    pub fn target_bitrate(&self) -> Option<u64> {
        self.settings().bitrate_kbps.map(|k| u64::from(k) * 1000)
    }
}

// ---------------------------------------------------------------------------
// Subtitles
// ---------------------------------------------------------------------------

/// ffmpeg encoder for a text subtitle format. Bitmap formats have none.
pub fn subtitle_encoder(codec: SubtitleCodec) -> Option<&'static str> {
    match codec {
        SubtitleCodec::WebVtt => Some("webvtt"),
        SubtitleCodec::Srt => Some("srt"),
        SubtitleCodec::Ass => Some("ass"),
        SubtitleCodec::MovText => Some("mov_text"),
        SubtitleCodec::Pgs | SubtitleCodec::DvdSub => None,
    }
}

/// File extension for a standalone subtitle file.
pub fn subtitle_extension(codec: SubtitleCodec) -> &'static str {
    match codec {
        SubtitleCodec::WebVtt => "vtt",
        SubtitleCodec::Srt => "srt",
        SubtitleCodec::Ass => "ass",
        SubtitleCodec::MovText => "mp4",
        SubtitleCodec::Pgs => "sup",
        SubtitleCodec::DvdSub => "sub",
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn push_opt(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

fn trim_float(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Parse "4.1" / "41" / "4" into (major, minor).
fn parse_level(level: &str) -> Option<(u32, u32)> {
    if let Some((major, minor)) = level.split_once('.') {
        return Some((major.parse().ok()?, minor.parse().ok()?));
    }
    let n: u32 = level.parse().ok()?;
    if n >= 10 {
        Some((n / 10, n % 10))
    } else {
        Some((n, 0))
    }
}
