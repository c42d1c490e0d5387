//! Font attachment extraction for styled (ASS) subtitles.

use std::path::{Path, PathBuf};

use ef_core::Result;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "ttc", "woff", "woff2"];

/// `ffmpeg -dump_attachment:t "" -i input -t 0 -f null -`, run inside
/// `out_dir` so attachments land there under their own file names.
pub fn extract_fonts_command(ffmpeg: &Path, input: &Path, out_dir: &Path) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin", "-dump_attachment:t", ""]);
    cmd.arg("-i");
    cmd.path_arg(input);
    cmd.args(["-t", "0", "-f", "null", "-"]);
    cmd.current_dir(out_dir);
    cmd
}

/// Dump every attachment of `input` into `out_dir` and return the font files
/// found there afterwards.
pub async fn extract_fonts(
    tools: &ToolRegistry,
    input: &Path,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>> {
    let ffmpeg = tools.ffmpeg()?;
    std::fs::create_dir_all(out_dir)?;
    tracing::info!(input = %input.display(), out_dir = %out_dir.display(), "Extracting font attachments");

    extract_fonts_command(ffmpeg, input, out_dir)
        .supervise(cancel, |_, _| {})
        .await?;

    let fonts = font_files(out_dir);
    tracing::debug!(count = fonts.len(), "Fonts extracted");
    Ok(fonts)
}

/// Font files directly inside `dir`, sorted by path.
pub(crate) fn font_files(dir: &Path) -> Vec<PathBuf> {
    let mut fonts: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FONT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    fonts.sort();
    fonts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_shape() {
        let cmd = extract_fonts_command(Path::new("ffmpeg"), Path::new("/m/in.mkv"), Path::new("/out/fonts"));
        assert_eq!(
            cmd.get_args(),
            &["-y", "-hide_banner", "-nostdin", "-dump_attachment:t", "", "-i", "/m/in.mkv", "-t", "0", "-f", "null", "-"]
        );
    }

    #[test]
    fn lists_only_fonts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.TTF", "a.otf", "cover.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/c.ttf"), b"x").unwrap();

        let names: Vec<String> = font_files(dir.path())
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["a.otf", "b.TTF"]);
    }
}
