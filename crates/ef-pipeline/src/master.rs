//! The master task: final assembly of a job's outputs.
//!
//! For HLS the master task packages any split video encodes into
//! renditions and writes `master.m3u8` from every completed variant. For
//! single-file containers it joins split parts and muxes each video
//! rendition with all audio and subtitle streams into the output folder;
//! an audio-only profile gets one file holding every stream.
//! Either way the job's work directory is removed afterwards unless
//! intermediates are kept.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ef_av::actions::{concat_parts, mux_streams, package_hls, MuxInput};
use ef_av::ProgressSnapshot;
use ef_core::{Error, Result};
use ef_dispatch::{JobType, ManifestInputs, TaskOutput, TaskSpec, VariantOutput};
use ef_manifest::{assemble_master, group_audio_by_codec};

use crate::executor::{measure, prepare_parent, quality_playlist, video_output, RunContext};
use crate::layout::OutputLayout;

/// Run the master task. Returns the task output and the final artifacts.
pub(crate) async fn run_master(ctx: &mut RunContext<'_>) -> Result<(TaskOutput, Vec<PathBuf>)> {
    let inputs = ctx.reporter.manifest_inputs(ctx.job.id)?;
    let result = if ctx.job.profile.container.is_segmented() {
        assemble_hls(ctx, &inputs).await
    } else {
        mux_single_files(ctx, &inputs).await
    };
    if result.is_ok() {
        cleanup_work_dir(ctx);
    }
    result
}

async fn assemble_hls(ctx: &mut RunContext<'_>, inputs: &ManifestInputs) -> Result<(TaskOutput, Vec<PathBuf>)> {
    let (job, media) = (ctx.job, ctx.media);
    let parts = inputs.split_parts();
    let stages = parts.len() as u32 * 2 + 1;
    let mut stage = 0;

    let mut video = inputs.video_variants();
    for (index, part_paths) in &parts {
        let output = video_output(&job.profile, *index)?;
        let source = media
            .primary_video()
            .ok_or_else(|| Error::validation("source has no video stream"))?;

        let joined = ctx.layout.joined_path(&output.name);
        concat_parts(ctx.tools, part_paths, &joined, &ctx.cancel).await?;
        stage_done(ctx, &mut stage, stages);

        let uri = OutputLayout::video_uri(&output.name);
        let playlist = ctx.layout.resolve(&uri);
        prepare_parent(&playlist)?;
        let variant_dir = playlist.parent().unwrap_or(ctx.layout.output_dir());
        let muxer_args = job.profile.container.muxer_args(variant_dir);
        package_hls(ctx.tools, &joined, &playlist, &muxer_args, &ctx.cancel).await?;
        stage_done(ctx, &mut stage, stages);

        let stats = measure(ctx, &playlist, ctx.config.min_output_bytes)?;
        video.push(quality_playlist(output, source, stats.as_ref(), uri));
    }

    let audio = group_audio_by_codec(inputs.audio_variants());
    let subtitles = inputs.subtitle_variants();
    let path = assemble_master(ctx.layout.output_dir(), &video, &audio, &subtitles)?;
    stage_done(ctx, &mut stage, stages);

    let output = TaskOutput::from_path(&path);
    Ok((output, vec![path]))
}

async fn mux_single_files(
    ctx: &mut RunContext<'_>,
    inputs: &ManifestInputs,
) -> Result<(TaskOutput, Vec<PathBuf>)> {
    let job = ctx.job;
    let profile = &job.profile;

    // Video renditions by output index, joining split parts first.
    let mut renditions: BTreeMap<usize, PathBuf> = inputs
        .of_type(JobType::Video)
        .filter_map(|done| match (&done.spec, &done.output.variant) {
            (TaskSpec::Video { output, .. }, Some(VariantOutput::Video(_))) => {
                Some((*output, done.output.path.clone()))
            }
            _ => None,
        })
        .collect();
    let parts = inputs.split_parts();
    let stages = (2 * parts.len() + renditions.len()).max(1) as u32;
    let mut stage = 0;
    for (index, part_paths) in &parts {
        let output = video_output(profile, *index)?;
        let joined = ctx.layout.joined_path(&output.name);
        concat_parts(ctx.tools, part_paths, &joined, &ctx.cancel).await?;
        stage_done(ctx, &mut stage, stages);
        renditions.insert(*index, joined);
    }

    let mut streams: Vec<MuxInput> = Vec::new();
    for done in &inputs.outputs {
        match &done.spec {
            TaskSpec::Audio {
                language,
                title,
                default,
                ..
            } => streams.push(MuxInput {
                path: done.output.path.clone(),
                language: language.clone(),
                title: title.clone(),
                default: *default,
            }),
            TaskSpec::Subtitle {
                language, default, ..
            } => streams.push(MuxInput {
                path: done.output.path.clone(),
                language: language.clone(),
                title: None,
                default: *default,
            }),
            _ => {}
        }
    }

    let muxer_args = profile.container.muxer_args(ctx.layout.output_dir());
    if renditions.is_empty() {
        // Audio-only profile: one file carrying every stream.
        if streams.is_empty() {
            return Err(Error::Manifest("no completed outputs to mux".into()));
        }
        let destination = ctx.layout.final_file(None, &profile.container);
        mux_streams(ctx.tools, &streams, &destination, &muxer_args, &ctx.cancel).await?;
        stage_done(ctx, &mut stage, stages);
        measure(ctx, &destination, ctx.config.min_output_bytes)?;
        let output = TaskOutput::from_path(&destination);
        return Ok((output, vec![destination]));
    }

    let single = renditions.len() == 1;
    let mut finals = Vec::with_capacity(renditions.len());
    let mut total_bytes = 0;
    for (index, video_path) in &renditions {
        let output = video_output(profile, *index)?;
        let destination = ctx
            .layout
            .final_file((!single).then_some(output.name.as_str()), &profile.container);
        let mut all = vec![MuxInput {
            path: video_path.clone(),
            language: None,
            title: Some(output.name.clone()),
            default: true,
        }];
        all.extend(streams.iter().cloned());
        mux_streams(ctx.tools, &all, &destination, &muxer_args, &ctx.cancel).await?;
        stage_done(ctx, &mut stage, stages);

        let stats = measure(ctx, &destination, ctx.config.min_output_bytes)?;
        total_bytes += stats.map_or_else(
            || std::fs::metadata(&destination).map(|m| m.len()).unwrap_or(0),
            |s| s.bytes,
        );
        finals.push(destination);
    }

    let mut output = TaskOutput::from_path(&finals[0]);
    output.size = total_bytes;
    Ok((output, finals))
}

fn stage_done(ctx: &mut RunContext<'_>, stage: &mut u32, stages: u32) {
    ctx.progress.set_stage(*stage, stages);
    ctx.progress.forward(&ProgressSnapshot {
        percentage: 100.0,
        finished: true,
        ..Default::default()
    });
    *stage += 1;
}

fn cleanup_work_dir(ctx: &RunContext<'_>) {
    if ctx.config.keep_intermediates {
        tracing::debug!(dir = %ctx.layout.work_dir().display(), "Keeping intermediates");
        return;
    }
    match std::fs::remove_dir_all(ctx.layout.work_dir()) {
        Ok(()) => tracing::debug!(dir = %ctx.layout.work_dir().display(), "Removed work directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            dir = %ctx.layout.work_dir().display(),
            error = %e,
            "Failed to remove work directory"
        ),
    }
}
