//! HLS packaging of an already encoded file with `-c copy`.

use std::path::Path;

use ef_core::Result;
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Stream-copy `input` into an HLS rendition. `muxer_args` carry the
/// `-f hls ...` flags (segment duration, type and naming).
pub fn package_hls_command(ffmpeg: &Path, input: &Path, playlist: &Path, muxer_args: &[String]) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin", "-i"]);
    cmd.path_arg(input);
    cmd.args(["-map", "0", "-c", "copy"]);
    cmd.args(muxer_args.iter().cloned());
    cmd.path_arg(playlist);
    cmd
}

pub async fn package_hls(
    tools: &ToolRegistry,
    input: &Path,
    playlist: &Path,
    muxer_args: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let ffmpeg = tools.ffmpeg()?;
    if let Some(dir) = playlist.parent() {
        std::fs::create_dir_all(dir)?;
    }
    tracing::info!(input = %input.display(), playlist = %playlist.display(), "Packaging HLS rendition");
    package_hls_command(ffmpeg, input, playlist, muxer_args)
        .supervise(cancel, |_, _| {})
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_then_muxer_args() {
        let args: Vec<String> = ["-f", "hls", "-hls_time", "6"].iter().map(|s| s.to_string()).collect();
        let cmd = package_hls_command(
            Path::new("ffmpeg"),
            Path::new("/w/joined.mkv"),
            Path::new("/out/video_1080p/index.m3u8"),
            &args,
        );
        assert_eq!(
            cmd.get_args().join(" "),
            "-y -hide_banner -nostdin -i /w/joined.mkv -map 0 -c copy -f hls -hls_time 6 /out/video_1080p/index.m3u8"
        );
    }
}
