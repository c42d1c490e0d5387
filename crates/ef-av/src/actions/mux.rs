//! Muxing separately encoded streams into one single-file container.

use std::path::{Path, PathBuf};

use ef_core::{Error, Result};
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// One input file contributing all of its streams.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxInput {
    pub path: PathBuf,
    pub language: Option<String>,
    pub title: Option<String>,
    pub default: bool,
}

impl MuxInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            language: None,
            title: None,
            default: false,
        }
    }
}

/// Build the mux invocation. `format_args` are the container muxer flags
/// placed just before the output path.
pub fn mux_streams_command(
    ffmpeg: &Path,
    inputs: &[MuxInput],
    output: &Path,
    format_args: &[String],
) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin"]);
    for input in inputs {
        cmd.arg("-i");
        cmd.path_arg(&input.path);
    }
    for i in 0..inputs.len() {
        cmd.args(["-map", &i.to_string()]);
    }
    cmd.args(["-c", "copy"]);
    for (i, input) in inputs.iter().enumerate() {
        if let Some(lang) = &input.language {
            cmd.args([format!("-metadata:s:{i}"), format!("language={lang}")]);
        }
        if let Some(title) = &input.title {
            cmd.args([format!("-metadata:s:{i}"), format!("title={title}")]);
        }
        let disposition = if input.default { "default" } else { "0" };
        cmd.args([format!("-disposition:{i}"), disposition.to_string()]);
    }
    cmd.args(format_args.iter().cloned());
    cmd.path_arg(output);
    cmd
}

pub async fn mux_streams(
    tools: &ToolRegistry,
    inputs: &[MuxInput],
    output: &Path,
    format_args: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::Internal("nothing to mux".into()));
    }
    let ffmpeg = tools.ffmpeg()?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(inputs = inputs.len(), output = %output.display(), "Muxing streams");
    mux_streams_command(ffmpeg, inputs, output, format_args)
        .supervise(cancel, |_, _| {})
        .await?;
    Ok(())
}
