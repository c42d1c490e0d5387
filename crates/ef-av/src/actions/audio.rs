//! Audio track language filtering.

use std::path::Path;

use ef_core::Result;
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Stream-copy `input` to `output` keeping video, subtitles, and only the
/// audio tracks tagged with one of `languages`.
pub fn filter_audio_languages_command(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    languages: &[String],
) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin", "-i"]);
    cmd.path_arg(input);
    cmd.args(["-map", "0:v?"]);
    for lang in languages {
        cmd.args(["-map", &format!("0:a:m:language:{lang}?")]);
    }
    cmd.args(["-map", "0:s?", "-c", "copy"]);
    cmd.path_arg(output);
    cmd
}

pub async fn filter_audio_languages(
    tools: &ToolRegistry,
    input: &Path,
    output: &Path,
    languages: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    if languages.is_empty() {
        return Err(ef_core::Error::validation("audio language filter needs at least one language"));
    }
    let ffmpeg = tools.ffmpeg()?;
    tracing::info!(input = %input.display(), languages = ?languages, "Filtering audio tracks by language");
    filter_audio_languages_command(ffmpeg, input, output, languages)
        .supervise(cancel, |_, _| {})
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_each_language_optionally() {
        let cmd = filter_audio_languages_command(
            Path::new("ffmpeg"),
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            &["eng".into(), "jpn".into()],
        );
        let args = cmd.get_args().join(" ");
        assert!(args.contains("-map 0:v? -map 0:a:m:language:eng? -map 0:a:m:language:jpn? -map 0:s? -c copy out.mp4"));
    }
}
