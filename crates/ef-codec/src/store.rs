//! Profile store with JSON persistence and built-in system profiles.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use ef_core::{Error, HwAccel, ProfileId, Result, SubtitleCodec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec::{AudioCodecConfig, AudioEncoderSettings, RateControl, VideoCodecConfig, VideoEncoderSettings};
use crate::container::{ContainerConfig, HlsSettings, Mp4Settings};
use crate::profile::{
    AudioOutput, EncodingOptions, EncodingProfile, HwAccelPreference, ScaleMode, SubtitleOutput,
    VideoOutput,
};

/// On-disk layout of the profile file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<EncodingProfile>,
}

/// In-memory profile registry backed by an optional JSON file.
///
/// System profiles are always present and immutable. User profiles are
/// persisted on every save/delete.
pub struct ProfileStore {
    path: Option<PathBuf>,
    profiles: RwLock<BTreeMap<ProfileId, EncodingProfile>>,
}

impl ProfileStore {
    /// Store holding only the built-in profiles, without persistence.
    pub fn in_memory() -> Self {
        let profiles = builtin_profiles().into_iter().map(|p| (p.id, p)).collect();
        Self {
            path: None,
            profiles: RwLock::new(profiles),
        }
    }

    /// Open (or create on first save) a profile file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };

        let file: ProfileFile = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No profile file at {}; starting with built-ins", path.display());
                ProfileFile::default()
            }
            Err(e) => return Err(e.into()),
        };

        {
            let mut profiles = store.profiles.write();
            for mut profile in file.profiles {
                if profiles.get(&profile.id).is_some_and(|p| p.system) {
                    tracing::warn!(
                        profile = %profile.name,
                        "Ignoring stored profile that shadows a system profile"
                    );
                    continue;
                }
                profile.system = false;
                profiles.insert(profile.id, profile);
            }
        }
        Ok(store)
    }

    /// Snapshot of a profile by id.
    pub fn get(&self, id: ProfileId) -> Result<EncodingProfile> {
        self.profiles
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("profile", id))
    }

    /// Snapshot of a profile by (case-insensitive) name.
    pub fn get_by_name(&self, name: &str) -> Result<EncodingProfile> {
        self.profiles
            .read()
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::not_found("profile", name))
    }

    /// Resolve a user-supplied reference: a profile id or a name.
    pub fn resolve(&self, reference: &str) -> Result<EncodingProfile> {
        match reference.parse::<ProfileId>() {
            Ok(id) => self.get(id),
            Err(_) => self.get_by_name(reference),
        }
    }

    /// All profiles, system profiles first, then by name.
    pub fn list(&self) -> Vec<EncodingProfile> {
        let mut all: Vec<_> = self.profiles.read().values().cloned().collect();
        all.sort_by(|a, b| b.system.cmp(&a.system).then_with(|| a.name.cmp(&b.name)));
        all
    }

    /// Insert or replace a user profile.
    pub fn save(&self, profile: EncodingProfile) -> Result<()> {
        if profile.system {
            return Err(Error::Conflict(format!(
                "profile '{}' is flagged system-provided and cannot be saved",
                profile.name
            )));
        }
        profile.validate()?;

        {
            let mut profiles = self.profiles.write();
            if let Some(existing) = profiles.get(&profile.id) {
                if existing.system {
                    return Err(Error::Conflict(format!(
                        "profile '{}' is system-provided and cannot be modified",
                        existing.name
                    )));
                }
            }
            if let Some(clash) = profiles
                .values()
                .find(|p| p.id != profile.id && p.name.eq_ignore_ascii_case(&profile.name))
            {
                return Err(Error::Conflict(format!(
                    "a profile named '{}' already exists",
                    clash.name
                )));
            }
            profiles.insert(profile.id, profile);
        }
        self.persist()
    }

    /// Remove a user profile.
    pub fn delete(&self, id: ProfileId) -> Result<()> {
        {
            let mut profiles = self.profiles.write();
            match profiles.get(&id) {
                None => return Err(Error::not_found("profile", id)),
                Some(p) if p.system => {
                    return Err(Error::Conflict(format!(
                        "profile '{}' is system-provided and cannot be deleted",
                        p.name
                    )))
                }
                Some(_) => {}
            }
            profiles.remove(&id);
        }
        self.persist()
    }

    /// Write user profiles atomically (temp file in the same directory,
    /// then rename).
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = ProfileFile {
            profiles: self
                .profiles
                .read()
                .values()
                .filter(|p| !p.system)
                .cloned()
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(path).map_err(|e| Error::from(e.error))?;
        tracing::debug!(path = %path.display(), count = file.profiles.len(), "Saved profiles");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in profiles
// ---------------------------------------------------------------------------

pub const HLS_H264_AAC: ProfileId = ProfileId::from_u128(0x0e1f_0000_0000_0000_0000_0000_0000_0001);
pub const HLS_HEVC_HDR: ProfileId = ProfileId::from_u128(0x0e1f_0000_0000_0000_0000_0000_0000_0002);
pub const MP4_H264: ProfileId = ProfileId::from_u128(0x0e1f_0000_0000_0000_0000_0000_0000_0003);

fn h264_ladder_rung(name: &str, height: u32, kbps: u32) -> VideoOutput {
    VideoOutput {
        name: name.into(),
        codec: VideoCodecConfig::H264(VideoEncoderSettings {
            rate_control: Some(RateControl::Bitrate {
                kbps,
                max_kbps: Some(kbps * 107 / 100),
                buffer_kbps: Some(kbps * 3 / 2),
            }),
            preset: Some("medium".into()),
            profile: Some("high".into()),
            pixel_format: Some("yuv420p".into()),
            keyframe_interval: Some(2.0),
            ..Default::default()
        }),
        width: None,
        height: Some(height),
        scale_mode: ScaleMode::Fit,
        tone_map: true,
        filters: vec![],
        skip_if_lower_resolution: true,
        extra_args: vec![],
    }
}

fn aac_stereo(kbps: u32) -> AudioOutput {
    AudioOutput {
        codec: AudioCodecConfig::Aac(AudioEncoderSettings {
            bitrate_kbps: Some(kbps),
            channels: Some(2),
            sample_rate: Some(48_000),
        }),
        languages: vec![],
        default_only: false,
        extra_args: vec![],
    }
}

/// The profiles shipped with the application.
pub fn builtin_profiles() -> Vec<EncodingProfile> {
    let hls = ContainerConfig::Hls(HlsSettings::default());

    let hls_h264 = EncodingProfile {
        id: HLS_H264_AAC,
        name: "hls-h264-aac".into(),
        description: "H.264 bitrate ladder with stereo AAC, HLS fMP4".into(),
        system: true,
        container: hls.clone(),
        video: vec![
            h264_ladder_rung("1080p", 1080, 5000),
            h264_ladder_rung("720p", 720, 2800),
            h264_ladder_rung("480p", 480, 1400),
        ],
        audio: vec![aac_stereo(128)],
        subtitles: vec![SubtitleOutput {
            codec: SubtitleCodec::WebVtt,
            languages: vec![],
            include_forced: false,
            burn_in: false,
        }],
        options: EncodingOptions::default(),
        custom_args: vec![],
    };

    let hevc_rung = |name: &str, height: u32, kbps: u32| VideoOutput {
        name: name.into(),
        codec: VideoCodecConfig::H265(VideoEncoderSettings {
            rate_control: Some(RateControl::Bitrate {
                kbps,
                max_kbps: Some(kbps * 110 / 100),
                buffer_kbps: Some(kbps * 2),
            }),
            preset: Some("medium".into()),
            profile: Some("main10".into()),
            pixel_format: Some("yuv420p10le".into()),
            keyframe_interval: Some(2.0),
            ..Default::default()
        }),
        width: None,
        height: Some(height),
        scale_mode: ScaleMode::Fit,
        tone_map: false,
        filters: vec![],
        skip_if_lower_resolution: true,
        extra_args: vec![],
    };

    let hls_hevc = EncodingProfile {
        id: HLS_HEVC_HDR,
        name: "hls-hevc-hdr".into(),
        description: "HDR HEVC ladder with an SDR H.264 fallback, AAC and E-AC-3".into(),
        system: true,
        container: hls,
        video: vec![
            hevc_rung("2160p-hdr", 2160, 16000),
            hevc_rung("1080p-hdr", 1080, 8000),
            h264_ladder_rung("1080p", 1080, 5000),
        ],
        audio: vec![
            aac_stereo(160),
            AudioOutput {
                codec: AudioCodecConfig::Eac3(AudioEncoderSettings {
                    bitrate_kbps: Some(640),
                    channels: Some(6),
                    sample_rate: None,
                }),
                languages: vec![],
                default_only: true,
                extra_args: vec![],
            },
        ],
        subtitles: vec![],
        options: EncodingOptions {
            hw_accel: HwAccelPreference::Prefer(HwAccel::Nvenc),
            ..Default::default()
        },
        custom_args: vec![],
    };

    let mp4 = EncodingProfile {
        id: MP4_H264,
        name: "mp4-h264".into(),
        description: "Single-file H.264/AAC MP4 for universal playback".into(),
        system: true,
        container: ContainerConfig::Mp4(Mp4Settings::default()),
        video: vec![VideoOutput {
            name: "1080p".into(),
            codec: VideoCodecConfig::H264(VideoEncoderSettings {
                rate_control: Some(RateControl::Crf { value: 20 }),
                preset: Some("medium".into()),
                profile: Some("high".into()),
                pixel_format: Some("yuv420p".into()),
                ..Default::default()
            }),
            width: None,
            height: Some(1080),
            scale_mode: ScaleMode::Fit,
            tone_map: true,
            filters: vec![],
            skip_if_lower_resolution: true,
            extra_args: vec![],
        }],
        audio: vec![AudioOutput {
            default_only: true,
            ..aac_stereo(160)
        }],
        subtitles: vec![SubtitleOutput {
            codec: SubtitleCodec::MovText,
            languages: vec![],
            include_forced: true,
            burn_in: false,
        }],
        options: EncodingOptions::default(),
        custom_args: vec![],
    };

    vec![hls_h264, hls_hevc, mp4]
}
