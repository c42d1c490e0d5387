//! Subtitle stream extraction into a sidecar file.

use std::path::Path;

use ef_core::Result;
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Build the ffmpeg invocation converting stream `stream_index` of `input`
/// with `encoder` (e.g. `webvtt`, `srt`) into `output`.
pub fn extract_subtitle_command(
    ffmpeg: &Path,
    input: &Path,
    stream_index: u32,
    encoder: &str,
    output: &Path,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin", "-i"]);
    cmd.path_arg(input);
    cmd.args(["-map", &format!("0:{stream_index}")]);
    cmd.args(["-c:s", encoder]);
    cmd.path_arg(output);
    cmd
}

/// Extract one subtitle stream to a sidecar file.
pub async fn extract_subtitle(
    tools: &ToolRegistry,
    input: &Path,
    stream_index: u32,
    encoder: &str,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let ffmpeg = tools.ffmpeg()?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(
        input = %input.display(),
        stream = stream_index,
        encoder,
        output = %output.display(),
        "Extracting subtitle sidecar"
    );
    extract_subtitle_command(ffmpeg, input, stream_index, encoder, output)
        .supervise(cancel, |_, _| {})
        .await?;
    Ok(())
}
