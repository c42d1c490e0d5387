//! Codec registry: what can be encoded, by which encoder, on which node.

use std::collections::BTreeSet;

use ef_core::{AudioCodec, HwAccel, StreamType, SubtitleCodec, VideoCodec};
use serde::Serialize;

use crate::codec::{subtitle_encoder, AudioCodecConfig, AudioEncoderSettings, VideoCodecConfig, VideoEncoderSettings};
use crate::profile::{EncodingProfile, HwAccelPreference};

/// Description of one encodable codec.
#[derive(Debug, Clone, Serialize)]
pub struct CodecDescriptor {
    pub name: String,
    pub stream_type: StreamType,
    /// (accelerator, encoder) pairs, software first.
    pub encoders: Vec<(HwAccel, &'static str)>,
}

/// Known codecs plus, optionally, the encoders the installed ffmpeg offers.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    available: Option<BTreeSet<String>>,
}

const ALL_ACCELS: [HwAccel; 5] = [
    HwAccel::None,
    HwAccel::Nvenc,
    HwAccel::Qsv,
    HwAccel::Vaapi,
    HwAccel::VideoToolbox,
];

impl CodecRegistry {
    /// Registry that assumes every known encoder is available.
    pub fn builtin() -> Self {
        Self { available: None }
    }

    /// Registry restricted to the encoders listed by `ffmpeg -encoders`.
    pub fn with_available_encoders(available: BTreeSet<String>) -> Self {
        Self {
            available: Some(available),
        }
    }

    /// Parse the output of `ffmpeg -hide_banner -encoders`.
    ///
    /// Encoder lines look like ` V....D libx264   libx264 H.264 / AVC ...`;
    /// the legend above the `------` separator is skipped.
    pub fn parse_encoder_list(stdout: &str) -> BTreeSet<String> {
        stdout
            .lines()
            .skip_while(|l| !l.trim_start().starts_with("------"))
            .skip(1)
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let flags = parts.next()?;
                let name = parts.next()?;
                (flags.len() == 6 && flags.chars().next().is_some_and(|c| "VAS".contains(c)))
                    .then(|| name.to_string())
            })
            .collect()
    }

    pub fn is_available(&self, encoder: &str) -> bool {
        self.available
            .as_ref()
            .map_or(true, |set| set.contains(encoder))
    }

    /// Pick the accelerator and encoder for a video output on a node that
    /// offers `node_accels`, honouring the profile preference.
    ///
    /// Falls back to software when no advertised accelerator can encode the
    /// codec or its encoder is missing from the installed ffmpeg.
    pub fn select_video_encoder(
        &self,
        codec: &VideoCodecConfig,
        preference: HwAccelPreference,
        node_accels: &[HwAccel],
    ) -> (HwAccel, &'static str) {
        let candidates: Vec<HwAccel> = match preference {
            HwAccelPreference::Software => vec![],
            HwAccelPreference::Prefer(hw) => vec![hw],
            HwAccelPreference::Auto => node_accels.to_vec(),
        };
        for hw in candidates {
            if !hw.is_hardware() || !node_accels.contains(&hw) {
                continue;
            }
            if let Some(enc) = codec.encoder_for(hw) {
                if self.is_available(enc) {
                    return (hw, enc);
                }
            }
        }
        codec.resolve_encoder(HwAccel::None)
    }

    /// Problems that would prevent a profile from running on this
    /// installation (beyond the profile's own validation).
    pub fn check_profile(&self, profile: &EncodingProfile) -> Vec<String> {
        let mut problems = Vec::new();
        for v in &profile.video {
            let (_, encoder) = v.codec.resolve_encoder(HwAccel::None);
            if !self.is_available(encoder) {
                problems.push(format!(
                    "video output '{}': encoder {encoder} is not available",
                    v.name
                ));
            }
        }
        for (i, a) in profile.audio.iter().enumerate() {
            if !self.is_available(a.codec.encoder()) {
                problems.push(format!(
                    "audio output #{i}: encoder {} is not available",
                    a.codec.encoder()
                ));
            }
        }
        for (i, s) in profile.subtitles.iter().filter(|s| !s.burn_in).enumerate() {
            match subtitle_encoder(s.codec) {
                Some(enc) if self.is_available(enc) => {}
                Some(enc) => problems.push(format!(
                    "subtitle output #{i}: encoder {enc} is not available"
                )),
                None => problems.push(format!(
                    "subtitle output #{i}: {} cannot be encoded",
                    s.codec
                )),
            }
        }
        problems
    }

    /// All known codecs with the encoders this installation offers.
    pub fn descriptors(&self) -> Vec<CodecDescriptor> {
        let mut out = Vec::new();
        let defaults = VideoEncoderSettings::default();
        for codec in [
            VideoCodecConfig::H264(defaults.clone()),
            VideoCodecConfig::H265(defaults.clone()),
            VideoCodecConfig::Av1(defaults.clone()),
            VideoCodecConfig::Vp9(defaults),
        ] {
            let encoders = ALL_ACCELS
                .iter()
                .filter_map(|hw| codec.encoder_for(*hw).map(|e| (*hw, e)))
                .filter(|(_, e)| self.is_available(e))
                .collect();
            out.push(CodecDescriptor {
                name: codec.kind().to_string(),
                stream_type: StreamType::Video,
                encoders,
            });
        }

        let a = AudioEncoderSettings::default();
        for codec in [
            AudioCodecConfig::Aac(a.clone()),
            AudioCodecConfig::Ac3(a.clone()),
            AudioCodecConfig::Eac3(a.clone()),
            AudioCodecConfig::Opus(a.clone()),
            AudioCodecConfig::Flac(a),
        ] {
            let enc = codec.encoder();
            out.push(CodecDescriptor {
                name: codec.kind().to_string(),
                stream_type: StreamType::Audio,
                encoders: if self.is_available(enc) {
                    vec![(HwAccel::None, enc)]
                } else {
                    vec![]
                },
            });
        }

        for codec in [
            SubtitleCodec::WebVtt,
            SubtitleCodec::Srt,
            SubtitleCodec::Ass,
            SubtitleCodec::MovText,
        ] {
            let encoders = subtitle_encoder(codec)
                .filter(|e| self.is_available(e))
                .map(|e| vec![(HwAccel::None, e)])
                .unwrap_or_default();
            out.push(CodecDescriptor {
                name: codec.to_string(),
                stream_type: StreamType::Subtitle,
                encoders,
            });
        }
        out
    }

    /// Whether a video codec kind has any usable encoder.
    pub fn supports_video(&self, kind: VideoCodec) -> bool {
        self.descriptors()
            .iter()
            .any(|d| d.stream_type == StreamType::Video && d.name == kind.to_string() && !d.encoders.is_empty())
    }

    /// Whether an audio codec kind has a usable encoder.
    pub fn supports_audio(&self, kind: AudioCodec) -> bool {
        self.descriptors()
            .iter()
            .any(|d| d.stream_type == StreamType::Audio && d.name == kind.to_string() && !d.encoders.is_empty())
    }
}
