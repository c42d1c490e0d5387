//! Task execution on a worker node.
//!
//! [`TaskExecutor`] runs one task end to end: it builds the ffmpeg command
//! for the task's spec, supervises the process with the task's cancellation
//! token, forwards throttled progress, runs post-processing actions,
//! validates the artifact and reports the outcome through a
//! [`TaskReporter`]. Master tasks are delegated to [`crate::master`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ef_av::{ProgressParser, ToolCommand, ToolRegistry};
use ef_codec::{CodecRegistry, ContainerConfig, EncodingProfile, VideoOutput};
use ef_core::config::ExecutorConfig;
use ef_core::{DynamicRange, Error, FailureKind, HwAccel, Result};
use ef_dispatch::{
    EncodingJob, EncodingTask, SegmentRange, TaskOutput, TaskReporter, TaskSpec, VariantOutput,
};
use ef_manifest::{AudioVariant, MediaPlaylist, QualityPlaylist, SubtitleVariant};
use ef_probe::{MediaInfo, VideoTrack};
use tokio_util::sync::CancellationToken;

use crate::actions::{create_actions, run_actions, ActionContext, PostActionConfig};
use crate::command::{
    output_dimensions, select_burn_in, AudioEncode, BurnIn, CommandBuilder, SubtitleEncode,
    VideoEncode,
};
use crate::layout::{sanitize, OutputLayout, SUBTITLE_FILE_NAME};
use crate::master;
use crate::progress::ProgressForwarder;
use crate::rules::{RuleContext, RuleEngine};
use crate::validate::{validate_output, OutputStats};

/// How a task run ended, from the executing node's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    Failed { kind: FailureKind, error: String },
    Cancelled,
    /// The dispatcher no longer wanted the task (cancelled, released or
    /// reassigned before it started).
    Abandoned,
}

/// Runs tasks handed out by the dispatcher.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &EncodingTask, reporter: &dyn TaskReporter) -> TaskOutcome;
}

/// The ffmpeg-backed [`TaskRunner`].
pub struct TaskExecutor {
    tools: Arc<ToolRegistry>,
    codecs: Arc<CodecRegistry>,
    rules: Arc<RuleEngine>,
    config: ExecutorConfig,
    work_root: PathBuf,
    node_accels: Vec<HwAccel>,
}

/// Per-run state shared by the task kinds.
pub(crate) struct RunContext<'a> {
    pub task: &'a EncodingTask,
    pub job: &'a EncodingJob,
    pub media: &'a MediaInfo,
    pub reporter: &'a dyn TaskReporter,
    pub layout: OutputLayout,
    pub tools: &'a ToolRegistry,
    pub config: &'a ExecutorConfig,
    pub cancel: CancellationToken,
    pub progress: ProgressForwarder<'a>,
    pub warnings: Vec<String>,
}

impl TaskExecutor {
    pub fn new(tools: Arc<ToolRegistry>, config: ExecutorConfig, work_root: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            codecs: Arc::new(CodecRegistry::builtin()),
            rules: Arc::new(RuleEngine::default()),
            config,
            work_root: work_root.into(),
            node_accels: Vec::new(),
        }
    }

    pub fn with_codec_registry(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_rules(mut self, rules: RuleEngine) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    /// Hardware encoders this node offers.
    pub fn with_node_accels(mut self, accels: Vec<HwAccel>) -> Self {
        self.node_accels = accels;
        self
    }

    fn commands(&self) -> Result<CommandBuilder> {
        Ok(CommandBuilder::new(
            self.tools.ffmpeg()?,
            self.config.process_timeout(),
            self.config.diagnostic_tail_lines,
        ))
    }

    /// Post-processing actions for `task`. Only profile-implied encode-time
    /// actions apply when the job disabled post-processing.
    fn actions_for(&self, task: &EncodingTask, job: &EncodingJob, media: &MediaInfo) -> Vec<PostActionConfig> {
        let ctx = RuleContext {
            spec: &task.spec,
            profile: &job.profile,
            media,
        };
        let mut actions = self.rules.resolve(&ctx);
        if !job.options.post_processing {
            actions.retain(PostActionConfig::is_encode_time);
        }
        actions
    }

    async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<TaskOutput> {
        let (task, job) = (ctx.task, ctx.job);
        if task.spec != TaskSpec::Master && !job.input_path.exists() {
            return Err(Error::InputNotFound(job.input_path.clone()));
        }
        let actions = self.actions_for(task, job, ctx.media);

        let (output, artifacts) = match &task.spec {
            TaskSpec::Video { output, segment } => {
                self.run_video(ctx, *output, segment.as_ref(), &actions).await?
            }
            TaskSpec::Audio { .. } => self.run_audio(ctx).await?,
            TaskSpec::Subtitle { .. } => self.run_subtitle(ctx).await?,
            TaskSpec::Master => master::run_master(ctx).await?,
        };

        let runnable = create_actions(&actions);
        if !runnable.is_empty() {
            let action_ctx = ActionContext {
                tools: Arc::clone(&self.tools),
                input: job.input_path.clone(),
                artifacts,
                spec: task.spec.clone(),
                task_name: task.name.clone(),
                cancel: ctx.cancel.clone(),
            };
            let warnings = run_actions(&runnable, &action_ctx).await?;
            ctx.warnings.extend(warnings);
        }
        Ok(output)
    }

    async fn run_video(
        &self,
        ctx: &mut RunContext<'_>,
        index: usize,
        segment: Option<&SegmentRange>,
        actions: &[PostActionConfig],
    ) -> Result<(TaskOutput, Vec<PathBuf>)> {
        let (task, job, media) = (ctx.task, ctx.job, ctx.media);
        let profile = &job.profile;
        let output = video_output(profile, index)?;
        let source = media
            .primary_video()
            .ok_or_else(|| Error::validation("source has no video stream"))?;
        let (hw, encoder) = self
            .codecs
            .select_video_encoder(&output.codec, profile.options.hw_accel, &self.node_accels);

        let mut burn_in: Option<BurnIn<'_>> = None;
        for action in actions {
            if let PostActionConfig::BurnInSubtitles {
                languages,
                include_forced,
                required,
            } = action
            {
                burn_in = select_burn_in(media, languages, *include_forced);
                if burn_in.is_none() {
                    let message = format!("{}: no text subtitle track to burn in", task.name);
                    if *required {
                        return Err(Error::validation(message));
                    }
                    ctx.warnings.push(message);
                }
            }
        }

        let segmented = profile.container.is_segmented();
        let (destination, container) = match segment {
            Some(seg) => (ctx.layout.part_path(&output.name, seg.index), ContainerConfig::Mkv),
            None if segmented => (
                ctx.layout.resolve(&OutputLayout::video_uri(&output.name)),
                profile.container.clone(),
            ),
            None => (
                ctx.layout.video_intermediate(&output.name, &profile.container),
                profile.container.clone(),
            ),
        };
        prepare_parent(&destination)?;
        std::fs::create_dir_all(ctx.layout.work_dir())?;
        let passlog = ctx
            .layout
            .work_dir()
            .join(format!("{}_passlog", sanitize(&task.name)));

        tracing::info!(
            task = %task.name,
            encoder,
            hw = %hw,
            destination = %destination.display(),
            "Encoding video"
        );
        let enc = VideoEncode {
            input: &job.input_path,
            source,
            output,
            segment,
            hw,
            threads: profile.options.threads,
            two_pass: profile.options.two_pass,
            burn_in,
            custom_args: &profile.custom_args,
            container: &container,
            destination: &destination,
            passlog: &passlog,
        };
        let commands = self.commands()?.video(&enc);

        let (frames, duration) = match segment {
            Some(seg) => (
                None,
                seg.duration.or_else(|| media.duration.map(|d| d.saturating_sub(seg.start))),
            ),
            None => (media.total_frames_estimate(), media.duration),
        };
        run_stages(ctx, &commands, || ProgressParser::new(frames, duration)).await?;

        let stats = measure(ctx, &destination, self.config.min_output_bytes)?;
        let variant = match segment {
            Some(seg) => VariantOutput::Part {
                output: index,
                index: seg.index,
            },
            None => {
                let uri = if segmented {
                    OutputLayout::video_uri(&output.name)
                } else {
                    file_name(&destination)
                };
                VariantOutput::Video(quality_playlist(output, source, stats.as_ref(), uri))
            }
        };
        Ok((
            finished_output(&destination, stats.as_ref(), variant),
            vec![destination],
        ))
    }

    async fn run_audio(&self, ctx: &mut RunContext<'_>) -> Result<(TaskOutput, Vec<PathBuf>)> {
        let (task, job, media) = (ctx.task, ctx.job, ctx.media);
        let TaskSpec::Audio {
            output: index,
            stream_index,
            language,
            channels,
            title,
            default,
        } = &task.spec
        else {
            return Err(Error::Internal("not an audio task".into()));
        };
        let profile = &job.profile;
        let output = profile
            .audio
            .get(*index)
            .ok_or_else(|| Error::Internal(format!("audio output #{index} missing from profile")))?;

        let segmented = profile.container.is_segmented();
        let uri = OutputLayout::audio_uri(language.as_deref(), &output.codec, *stream_index);
        let destination = if segmented {
            ctx.layout.resolve(&uri)
        } else {
            ctx.layout
                .audio_intermediate(language.as_deref(), &output.codec, *stream_index, &profile.container)
        };
        prepare_parent(&destination)?;

        let command = self.commands()?.audio(&AudioEncode {
            input: &job.input_path,
            stream_index: *stream_index,
            language: language.as_deref(),
            title: title.as_deref(),
            output,
            threads: profile.options.threads,
            container: &profile.container,
            destination: &destination,
        });
        let duration = media.duration;
        run_stages(ctx, std::slice::from_ref(&command), || ProgressParser::new(None, duration)).await?;

        let stats = measure(ctx, &destination, self.config.min_output_bytes)?;
        let label = title
            .clone()
            .or_else(|| language.clone())
            .unwrap_or_else(|| "und".to_string());
        let variant = VariantOutput::Audio(AudioVariant {
            name: format!("{label} ({stream_index})"),
            codec: output.codec.kind(),
            language: language.clone(),
            channels: Some(output.codec.settings().channels.unwrap_or(*channels)),
            bandwidth: stats
                .as_ref()
                .and_then(|s| s.peak_bandwidth)
                .or_else(|| output.codec.target_bitrate())
                .unwrap_or(0),
            default: *default,
            uri: if segmented { uri } else { file_name(&destination) },
        });
        Ok((
            finished_output(&destination, stats.as_ref(), variant),
            vec![destination],
        ))
    }

    async fn run_subtitle(&self, ctx: &mut RunContext<'_>) -> Result<(TaskOutput, Vec<PathBuf>)> {
        let (task, job, media) = (ctx.task, ctx.job, ctx.media);
        let TaskSpec::Subtitle {
            output: index,
            stream_index,
            language,
            forced,
            default,
            ..
        } = &task.spec
        else {
            return Err(Error::Internal("not a subtitle task".into()));
        };
        let profile = &job.profile;
        let output = profile
            .subtitles
            .get(*index)
            .ok_or_else(|| Error::Internal(format!("subtitle output #{index} missing from profile")))?;

        let segmented = profile.container.is_segmented();
        let uri = OutputLayout::subtitle_uri(language.as_deref(), *stream_index);
        let (destination, artifact) = if segmented {
            let playlist = ctx.layout.resolve(&uri);
            let vtt = playlist.with_file_name(SUBTITLE_FILE_NAME);
            (vtt, playlist)
        } else {
            let file = ctx
                .layout
                .subtitle_intermediate(language.as_deref(), output.codec, *stream_index);
            (file.clone(), file)
        };
        prepare_parent(&destination)?;

        let command = self.commands()?.subtitle(&SubtitleEncode {
            input: &job.input_path,
            stream_index: *stream_index,
            language: language.as_deref(),
            codec: output.codec,
            destination: &destination,
        })?;
        let duration = media.duration;
        run_stages(ctx, std::slice::from_ref(&command), || ProgressParser::new(None, duration)).await?;

        if segmented {
            let playlist = MediaPlaylist::single_file(SUBTITLE_FILE_NAME, duration.unwrap_or_default());
            std::fs::write(&artifact, playlist.render())?;
        }
        // Subtitle files are legitimately tiny.
        let stats = measure(ctx, &artifact, 1)?;
        let mut name = language.clone().unwrap_or_else(|| "und".to_string());
        if *forced {
            name.push_str(" forced");
        }
        let variant = VariantOutput::Subtitle(SubtitleVariant {
            name: format!("{name} ({stream_index})"),
            language: language.clone(),
            forced: *forced,
            default: *default,
            uri: if segmented { uri } else { file_name(&artifact) },
        });
        Ok((
            finished_output(&artifact, stats.as_ref(), variant),
            vec![artifact],
        ))
    }
}

#[async_trait]
impl TaskRunner for TaskExecutor {
    async fn run(&self, task: &EncodingTask, reporter: &dyn TaskReporter) -> TaskOutcome {
        let Some(job) = reporter.job_snapshot(task.job_id) else {
            tracing::warn!(task = %task.name, "Job vanished before the task started");
            return TaskOutcome::Abandoned;
        };
        let Some(media) = job.media.as_ref() else {
            let error = format!("job {} has no source analysis", job.id);
            reporter.report_failed(task.id, FailureKind::Internal, &error);
            return TaskOutcome::Failed {
                kind: FailureKind::Internal,
                error,
            };
        };
        if !reporter.report_started(task.id) {
            return TaskOutcome::Abandoned;
        }
        let cancel = reporter.cancellation_token(task.id).unwrap_or_default();

        let mut ctx = RunContext {
            task,
            job: &job,
            media,
            reporter,
            layout: OutputLayout::new(job.id, &job.input_path, &job.output_path, &self.work_root),
            tools: &self.tools,
            config: &self.config,
            cancel,
            progress: ProgressForwarder::new(reporter, task.id, self.config.progress_throttle()),
            warnings: Vec::new(),
        };

        let result = self.execute(&mut ctx).await;
        for warning in &ctx.warnings {
            reporter.report_warning(job.id, warning);
        }
        match result {
            Ok(output) => {
                tracing::info!(task = %task.name, path = %output.path.display(), bytes = output.size, "Task completed");
                if reporter.report_completed(task.id, output.clone()) {
                    TaskOutcome::Completed(output)
                } else {
                    TaskOutcome::Abandoned
                }
            }
            // The dispatcher cancelled this attempt and has already moved
            // the task on.
            Err(e) if e.is_cancelled() => {
                tracing::info!(task = %task.name, "Task cancelled");
                TaskOutcome::Cancelled
            }
            Err(e) => {
                let kind = e.failure_kind();
                let error = e.to_string();
                tracing::error!(task = %task.name, kind = %kind, error = %error, "Task failed");
                reporter.report_failed(task.id, kind, &error);
                TaskOutcome::Failed { kind, error }
            }
        }
    }
}

/// Run `commands` in order, each as one progress stage.
pub(crate) async fn run_stages(
    ctx: &mut RunContext<'_>,
    commands: &[ToolCommand],
    parser: impl Fn() -> ProgressParser,
) -> Result<()> {
    let count = commands.len() as u32;
    for (i, command) in commands.iter().enumerate() {
        ctx.progress.set_stage(i as u32, count);
        let mut parser = parser();
        let progress = &mut ctx.progress;
        tracing::debug!(task = %ctx.task.name, command = %command, "Running stage {}/{count}", i + 1);
        command
            .supervise(&ctx.cancel, |_, line| {
                if let Some(snapshot) = parser.parse_line(line) {
                    progress.forward(&snapshot);
                }
            })
            .await?;
    }
    Ok(())
}

/// Validate `path` when the job asks for it; otherwise measure it on a
/// best-effort basis.
pub(crate) fn measure(ctx: &RunContext<'_>, path: &Path, min_bytes: u64) -> Result<Option<OutputStats>> {
    if ctx.job.options.validation {
        validate_output(path, min_bytes).map(Some)
    } else {
        Ok(validate_output(path, 0).ok())
    }
}

/// Variant descriptor for a finished video rendition.
pub(crate) fn quality_playlist(
    output: &VideoOutput,
    source: &VideoTrack,
    stats: Option<&OutputStats>,
    uri: String,
) -> QualityPlaylist {
    let (width, height) = output_dimensions(output, source.width, source.height);
    let tone_mapped = output.tone_map && source.hdr_format.is_hdr();
    let (dynamic_range, bit_depth) = if tone_mapped {
        (DynamicRange::Sdr, 8)
    } else {
        (source.hdr_format.dynamic_range(), source.bit_depth.unwrap_or(8))
    };
    QualityPlaylist {
        name: output.name.clone(),
        width,
        height,
        bandwidth: stats
            .and_then(|s| s.peak_bandwidth)
            .or_else(|| output.codec.target_bitrate())
            .unwrap_or(0),
        average_bandwidth: stats.and_then(|s| s.average_bandwidth),
        codecs: output.codec.codec_string(width, height, bit_depth),
        frame_rate: source.frame_rate,
        dynamic_range,
        uri,
    }
}

pub(crate) fn finished_output(path: &Path, stats: Option<&OutputStats>, variant: VariantOutput) -> TaskOutput {
    let mut output = TaskOutput::from_path(path);
    if let Some(stats) = stats {
        output.size = stats.bytes;
    }
    output.variant = Some(variant);
    output
}

pub(crate) fn prepare_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Profile lookups shared with the master task.
pub(crate) fn video_output(profile: &EncodingProfile, index: usize) -> Result<&VideoOutput> {
    profile
        .video
        .get(index)
        .ok_or_else(|| Error::Internal(format!("video output #{index} missing from profile")))
}
