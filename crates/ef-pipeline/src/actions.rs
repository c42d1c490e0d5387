//! Post-processing actions run after a task's primary transcode.
//!
//! Actions come from [`crate::rules`]. Burn-in is the exception: it changes
//! the encode itself, so the command builder consumes it and it never runs
//! as a step of its own. A failing action is downgraded to a job warning
//! unless the action is marked `required`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ef_av::actions::{exec_command, extract_fonts, extract_subtitle, filter_audio_languages};
use ef_av::ToolRegistry;
use ef_codec::codec::{subtitle_encoder, subtitle_extension};
use ef_core::{Error, Result, SubtitleCodec};
use ef_dispatch::TaskSpec;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Serialized form of an action, as it appears in rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostActionConfig {
    /// Write the task's source subtitle track next to its output.
    SubtitleSidecar {
        codec: SubtitleCodec,
        #[serde(default)]
        required: bool,
    },
    /// Render matching text subtitles into the video frames.
    BurnInSubtitles {
        #[serde(default)]
        languages: Vec<String>,
        #[serde(default)]
        include_forced: bool,
        #[serde(default)]
        required: bool,
    },
    /// Dump font attachments of the source into `fonts/` beside the output.
    ExtractFonts {
        #[serde(default)]
        required: bool,
    },
    /// Drop audio streams whose language is not listed.
    FilterAudioLanguages {
        languages: Vec<String>,
        #[serde(default)]
        required: bool,
    },
    /// Run an arbitrary command. `{input}`, `{output}`, `{output_dir}` and
    /// `{task}` are substituted in `args`.
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        required: bool,
    },
}

impl PostActionConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubtitleSidecar { .. } => "subtitle_sidecar",
            Self::BurnInSubtitles { .. } => "burn_in_subtitles",
            Self::ExtractFonts { .. } => "extract_fonts",
            Self::FilterAudioLanguages { .. } => "filter_audio_languages",
            Self::Exec { .. } => "exec",
        }
    }

    /// Whether a failure of this action fails the task.
    pub fn required(&self) -> bool {
        match self {
            Self::SubtitleSidecar { required, .. }
            | Self::BurnInSubtitles { required, .. }
            | Self::ExtractFonts { required }
            | Self::FilterAudioLanguages { required, .. }
            | Self::Exec { required, .. } => *required,
        }
    }

    /// Applied while encoding rather than afterwards.
    pub fn is_encode_time(&self) -> bool {
        matches!(self, Self::BurnInSubtitles { .. })
    }
}

/// Everything an action may look at.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub tools: Arc<ToolRegistry>,
    /// The job's source file.
    pub input: PathBuf,
    /// Primary artifacts of the task (one per rendition for a single-file
    /// master task, the media playlist for segmented outputs).
    pub artifacts: Vec<PathBuf>,
    pub spec: TaskSpec,
    pub task_name: String,
    pub cancel: CancellationToken,
}

impl ActionContext {
    /// Directory of the first artifact; actions write their side files here.
    pub fn output_dir(&self) -> Result<&Path> {
        self.artifacts
            .first()
            .and_then(|p| p.parent())
            .ok_or_else(|| Error::Internal(format!("task {} produced no artifact", self.task_name)))
    }
}

/// A single post-processing step.
#[async_trait]
pub trait PostAction: Send + Sync {
    fn name(&self) -> &'static str;

    fn required(&self) -> bool;

    /// Perform the action. Returns a short summary for the log.
    async fn execute(&self, ctx: &ActionContext) -> Result<String>;
}

/// Build runnable actions, skipping encode-time ones.
pub fn create_actions(configs: &[PostActionConfig]) -> Vec<Box<dyn PostAction>> {
    configs
        .iter()
        .filter(|c| !c.is_encode_time())
        .filter_map(|config| -> Option<Box<dyn PostAction>> {
            let required = config.required();
            match config {
                PostActionConfig::SubtitleSidecar { codec, .. } => Some(Box::new(SubtitleSidecar {
                    codec: *codec,
                    required,
                })),
                PostActionConfig::ExtractFonts { .. } => Some(Box::new(ExtractFonts { required })),
                PostActionConfig::FilterAudioLanguages { languages, .. } => {
                    Some(Box::new(FilterAudio {
                        languages: languages.clone(),
                        required,
                    }))
                }
                PostActionConfig::Exec { program, args, .. } => Some(Box::new(Exec {
                    program: program.clone(),
                    args: args.clone(),
                    required,
                })),
                PostActionConfig::BurnInSubtitles { .. } => None,
            }
        })
        .collect()
}

/// Run `actions` in order. Returns warnings for optional actions that
/// failed; the first failing required action (or a cancellation) aborts.
pub async fn run_actions(actions: &[Box<dyn PostAction>], ctx: &ActionContext) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    for action in actions {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match action.execute(ctx).await {
            Ok(summary) => {
                tracing::info!(task = %ctx.task_name, action = action.name(), "{summary}");
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if action.required() => {
                tracing::error!(task = %ctx.task_name, action = action.name(), error = %e, "Required action failed");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(task = %ctx.task_name, action = action.name(), error = %e, "Action failed");
                warnings.push(format!("{}: {} failed: {e}", ctx.task_name, action.name()));
            }
        }
    }
    Ok(warnings)
}

struct SubtitleSidecar {
    codec: SubtitleCodec,
    required: bool,
}

#[async_trait]
impl PostAction for SubtitleSidecar {
    fn name(&self) -> &'static str {
        "subtitle_sidecar"
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String> {
        let TaskSpec::Subtitle {
            stream_index,
            language,
            ..
        } = &ctx.spec
        else {
            return Err(Error::validation("subtitle sidecars apply to subtitle tasks only"));
        };
        let encoder = subtitle_encoder(self.codec).ok_or_else(|| {
            Error::validation(format!("cannot write {} subtitles as a sidecar", self.codec))
        })?;
        let name = format!(
            "{}_{stream_index}.{}",
            language.as_deref().unwrap_or("und"),
            subtitle_extension(self.codec)
        );
        let output = ctx.output_dir()?.join(name);
        extract_subtitle(&ctx.tools, &ctx.input, *stream_index, encoder, &output, &ctx.cancel).await?;
        Ok(format!("wrote {}", output.display()))
    }
}

struct ExtractFonts {
    required: bool,
}

#[async_trait]
impl PostAction for ExtractFonts {
    fn name(&self) -> &'static str {
        "extract_fonts"
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String> {
        let dir = ctx.output_dir()?;
        // Segmented renditions live one level below the output folder.
        let base = if ctx.artifacts.iter().any(|a| is_playlist(a)) {
            dir.parent().unwrap_or(dir)
        } else {
            dir
        };
        let fonts = extract_fonts(&ctx.tools, &ctx.input, &base.join("fonts"), &ctx.cancel).await?;
        Ok(format!("extracted {} fonts", fonts.len()))
    }
}

struct FilterAudio {
    languages: Vec<String>,
    required: bool,
}

#[async_trait]
impl PostAction for FilterAudio {
    fn name(&self) -> &'static str {
        "filter_audio_languages"
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String> {
        for artifact in &ctx.artifacts {
            if is_playlist(artifact) {
                return Err(Error::validation(
                    "audio language filtering needs a single-file output",
                ));
            }
            let dir = artifact.parent().unwrap_or(Path::new("."));
            let suffix = artifact
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let tmp = tempfile::Builder::new()
                .prefix(".filter-")
                .suffix(&suffix)
                .tempfile_in(dir)?
                .into_temp_path();
            filter_audio_languages(&ctx.tools, artifact, &tmp, &self.languages, &ctx.cancel).await?;
            tmp.persist(artifact).map_err(|e| Error::from(e.error))?;
        }
        Ok(format!("kept audio in {}", self.languages.join(",")))
    }
}

struct Exec {
    program: String,
    args: Vec<String>,
    required: bool,
}

#[async_trait]
impl PostAction for Exec {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String> {
        let dir = ctx.output_dir()?;
        let output = ctx.artifacts[0].to_string_lossy().to_string();
        let vars = [
            ("input", ctx.input.to_string_lossy().to_string()),
            ("output", output),
            ("output_dir", dir.to_string_lossy().to_string()),
            ("task", ctx.task_name.clone()),
        ];
        exec_command(&self.program, &self.args, &vars, dir, &ctx.cancel).await?;
        Ok(format!("ran {}", self.program))
    }
}

fn is_playlist(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "m3u8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &Path, spec: TaskSpec) -> ActionContext {
        let artifact = dir.join("out.mkv");
        std::fs::write(&artifact, b"data").unwrap();
        ActionContext {
            tools: Arc::new(ToolRegistry::with_paths("/nonexistent/ffmpeg", "/nonexistent/ffprobe")),
            input: dir.join("in.mkv"),
            artifacts: vec![artifact],
            spec,
            task_name: "1080p video".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn config_parses_with_defaults() {
        let config: PostActionConfig =
            serde_json::from_str(r#"{"type": "filter_audio_languages", "languages": ["eng"]}"#).unwrap();
        assert!(!config.required());
        assert_eq!(config.name(), "filter_audio_languages");
    }

    #[test]
    fn burn_in_is_not_a_runnable_action() {
        let configs = vec![
            PostActionConfig::BurnInSubtitles {
                languages: vec![],
                include_forced: false,
                required: true,
            },
            PostActionConfig::ExtractFonts { required: false },
        ];
        let actions = create_actions(&configs);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name(), "extract_fonts");
    }

    #[tokio::test]
    async fn exec_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), TaskSpec::Master);
        let actions = create_actions(&[PostActionConfig::Exec {
            program: "sh".into(),
            args: vec!["-c".into(), "cp {output} copied.mkv".into()],
            required: true,
        }]);
        let warnings = run_actions(&actions, &ctx).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(std::fs::read(dir.path().join("copied.mkv")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn optional_failure_becomes_warning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), TaskSpec::Master);
        let actions = create_actions(&[
            PostActionConfig::Exec {
                program: "sh".into(),
                args: vec!["-c".into(), "exit 3".into()],
                required: false,
            },
            PostActionConfig::Exec {
                program: "sh".into(),
                args: vec!["-c".into(), "touch after".into()],
                required: false,
            },
        ]);
        let warnings = run_actions(&actions, &ctx).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("1080p video: exec failed"));
        assert!(dir.path().join("after").exists());
    }

    #[tokio::test]
    async fn required_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), TaskSpec::Master);
        let actions = create_actions(&[
            PostActionConfig::Exec {
                program: "sh".into(),
                args: vec!["-c".into(), "exit 1".into()],
                required: true,
            },
            PostActionConfig::Exec {
                program: "sh".into(),
                args: vec!["-c".into(), "touch after".into()],
                required: false,
            },
        ]);
        let err = run_actions(&actions, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
        assert!(!dir.path().join("after").exists());
    }

    #[tokio::test]
    async fn sidecar_rejects_non_subtitle_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), TaskSpec::Master);
        let actions = create_actions(&[PostActionConfig::SubtitleSidecar {
            codec: SubtitleCodec::Srt,
            required: true,
        }]);
        let err = run_actions(&actions, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), TaskSpec::Master);
        ctx.cancel.cancel();
        let actions = create_actions(&[PostActionConfig::ExtractFonts { required: false }]);
        assert!(run_actions(&actions, &ctx).await.unwrap_err().is_cancelled());
    }
}
