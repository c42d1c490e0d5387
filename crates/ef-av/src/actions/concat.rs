//! Concatenation of split video parts.

use std::io::Write;
use std::path::{Path, PathBuf};

use ef_core::{Error, Result};
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Contents of an ffmpeg concat-demuxer list for `parts`, in order.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

/// Join `parts` (same codec parameters, encoded from adjacent time ranges)
/// into `output` without re-encoding.
pub async fn concat_parts(
    tools: &ToolRegistry,
    parts: &[PathBuf],
    output: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    if parts.is_empty() {
        return Err(Error::Internal("nothing to concatenate".into()));
    }
    let ffmpeg = tools.ffmpeg()?;
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut list = tempfile::Builder::new()
        .prefix("concat-")
        .suffix(".txt")
        .tempfile_in(dir)?;
    list.write_all(concat_list(parts).as_bytes())?;
    list.flush()?;

    tracing::info!(parts = parts.len(), output = %output.display(), "Concatenating split parts");

    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin", "-f", "concat", "-safe", "0", "-i"]);
    cmd.path_arg(list.path());
    cmd.args(["-map", "0", "-c", "copy"]);
    cmd.path_arg(output);
    cmd.supervise(cancel, |_, _| {}).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_escapes_quotes() {
        let list = concat_list(&[PathBuf::from("/w/part_000.mkv"), PathBuf::from("/w/it's.mkv")]);
        assert_eq!(list, "file '/w/part_000.mkv'\nfile '/w/it'\\''s.mkv'\n");
    }

    #[tokio::test]
    async fn empty_parts_rejected() {
        let tools = ToolRegistry::with_paths("ffmpeg", "ffprobe");
        let err = concat_parts(&tools, &[], Path::new("/tmp/out.mkv"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nothing to concatenate"));
    }
}
