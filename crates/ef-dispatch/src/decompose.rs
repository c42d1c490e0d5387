//! Turning a profile and a source description into tasks.

use ef_codec::{EncodingProfile, VideoOutput};
use ef_core::config::DispatcherConfig;
use ef_core::{Error, HwAccel, Result};
use ef_probe::MediaInfo;

use crate::model::{JobOptions, TaskSpec};
use crate::strategy::{segment_ranges, NodeStrategy};

/// A task before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub name: String,
    pub spec: TaskSpec,
    pub preferred_hw: Option<HwAccel>,
}

/// Tasks for one job, master last, plus anything worth telling the operator.
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub tasks: Vec<PlannedTask>,
    pub warnings: Vec<String>,
}

/// Decompose a job.
///
/// Video outputs that would upscale the source are dropped when they ask
/// for it; if that drops every video output, the smallest one is kept so the
/// job still produces a picture. Audio and subtitle outputs fan out over the
/// source tracks their filters select. Bitmap subtitle tracks are skipped
/// since they cannot be converted to a text format.
pub fn plan_tasks(
    profile: &EncodingProfile,
    media: &MediaInfo,
    options: &JobOptions,
    node_count: usize,
    config: &DispatcherConfig,
) -> Result<TaskPlan> {
    let mut plan = TaskPlan::default();

    let videos = select_video_outputs(profile, media, &mut plan.warnings)?;
    let preferred_hw = match options.nodes {
        NodeStrategy::SoftwareOnly => None,
        _ => profile.options.hw_accel.required(),
    };
    let segments = options.split.segment_count(media.duration, node_count, config);
    for (output, video) in videos {
        if segments <= 1 {
            plan.tasks.push(PlannedTask {
                name: format!("{} video", video.name),
                spec: TaskSpec::Video {
                    output,
                    segment: None,
                },
                preferred_hw,
            });
            continue;
        }
        let duration = media.duration.unwrap_or_default();
        for range in segment_ranges(duration, segments) {
            plan.tasks.push(PlannedTask {
                name: format!("{} video part {}/{}", video.name, range.index + 1, range.count),
                spec: TaskSpec::Video {
                    output,
                    segment: Some(range),
                },
                preferred_hw,
            });
        }
    }

    for (output, audio) in profile.audio.iter().enumerate() {
        let tracks = media.select_audio(&audio.languages, audio.default_only);
        if tracks.is_empty() {
            plan.warnings.push(format!(
                "audio output #{output} ({}) matched no source tracks",
                audio.codec.kind()
            ));
        }
        for track in tracks {
            let lang = track.language.as_deref().unwrap_or("und");
            plan.tasks.push(PlannedTask {
                name: format!("{lang} audio {} #{}", audio.codec.kind(), track.index),
                spec: TaskSpec::Audio {
                    output,
                    stream_index: track.index,
                    language: track.language.clone(),
                    channels: audio.codec.settings().channels.unwrap_or(track.channels),
                    title: track.title.clone(),
                    default: track.default,
                },
                preferred_hw: None,
            });
        }
    }

    for (output, subtitle) in profile.subtitles.iter().enumerate() {
        if subtitle.burn_in {
            continue;
        }
        for track in media.select_subtitles(&subtitle.languages, subtitle.include_forced) {
            if !track.is_text() {
                plan.warnings.push(format!(
                    "subtitle track #{} ({}) is a bitmap format and cannot be converted to {}",
                    track.index, track.codec, subtitle.codec
                ));
                continue;
            }
            let lang = track.language.as_deref().unwrap_or("und");
            plan.tasks.push(PlannedTask {
                name: format!("{lang} subtitle {} #{}", subtitle.codec, track.index),
                spec: TaskSpec::Subtitle {
                    output,
                    stream_index: track.index,
                    source_codec: track.subtitle_codec(),
                    language: track.language.clone(),
                    forced: track.forced,
                    default: track.default,
                },
                preferred_hw: None,
            });
        }
    }

    if plan.tasks.is_empty() {
        return Err(Error::validation(format!(
            "no output of profile '{}' matches the streams in {}",
            profile.name,
            media.file_path.display()
        )));
    }

    let master_name = if profile.container.is_segmented() {
        "master manifest"
    } else {
        "master mux"
    };
    plan.tasks.push(PlannedTask {
        name: master_name.to_string(),
        spec: TaskSpec::Master,
        preferred_hw: None,
    });
    Ok(plan)
}

fn select_video_outputs<'a>(
    profile: &'a EncodingProfile,
    media: &MediaInfo,
    warnings: &mut Vec<String>,
) -> Result<Vec<(usize, &'a VideoOutput)>> {
    if profile.video.is_empty() {
        return Ok(Vec::new());
    }
    let Some(source) = media.primary_video() else {
        return Err(Error::validation(format!(
            "profile '{}' has video outputs but {} has no video stream",
            profile.name,
            media.file_path.display()
        )));
    };

    let mut selected = Vec::new();
    for (i, v) in profile.video.iter().enumerate() {
        if v.skip_if_lower_resolution && v.would_upscale(source.width, source.height) {
            warnings.push(format!(
                "video output '{}' skipped: source is only {}x{}",
                v.name, source.width, source.height
            ));
            continue;
        }
        selected.push((i, v));
    }

    if selected.is_empty() {
        let smallest = profile
            .video
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| (v.height.unwrap_or(0), v.width.unwrap_or(0)));
        if let Some((i, v)) = smallest {
            warnings.push(format!(
                "every video output exceeds the source resolution; keeping '{}'",
                v.name
            ));
            selected.push((i, v));
        }
    }
    Ok(selected)
}
