//! End-to-end checks against a real ffmpeg. Skipped when ffmpeg is not
//! installed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ef_av::actions::{concat_parts, package_hls};
use ef_av::{ProgressParser, Stream, ToolCommand, ToolRegistry};
use ef_core::config::ToolsConfig;
use tokio_util::sync::CancellationToken;

fn tools() -> Option<ToolRegistry> {
    let tools = ToolRegistry::discover(&ToolsConfig::default());
    if tools.ffmpeg().is_err() {
        eprintln!("ffmpeg not installed; skipping");
        return None;
    }
    Some(tools)
}

/// Encode a synthetic clip with the built-in mpeg4 encoder, streaming
/// `-progress` output through the parser.
async fn synth_clip(ffmpeg: &Path, out: &Path, seconds: u32) -> Vec<f64> {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostdin", "-nostats", "-progress", "pipe:1"])
        .args(["-f", "lavfi", "-i"])
        .arg(format!("testsrc=duration={seconds}:size=320x240:rate=25"))
        .args(["-c:v", "mpeg4", "-q:v", "5", "-g", "25"])
        .path_arg(out);

    let mut parser = ProgressParser::new(Some(u64::from(seconds) * 25), Some(Duration::from_secs(u64::from(seconds))));
    let mut percentages = Vec::new();
    cmd.supervise(&CancellationToken::new(), |stream, line| {
        if stream == Stream::Stdout {
            if let Some(s) = parser.parse_line(line) {
                percentages.push(s.percentage);
            }
        }
    })
    .await
    .expect("synthetic encode");
    percentages
}

#[tokio::test]
async fn progress_reaches_completion() {
    let Some(tools) = tools() else { return };
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("clip.mkv");

    let percentages = synth_clip(tools.ffmpeg().unwrap(), &out, 2).await;
    assert!(!percentages.is_empty());
    assert_eq!(percentages.last().copied(), Some(100.0));
    assert!(out.metadata().unwrap().len() > 0);
}

#[tokio::test]
async fn concat_then_package() {
    let Some(tools) = tools() else { return };
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = tools.ffmpeg().unwrap().to_path_buf();

    let parts: Vec<PathBuf> = (0..2).map(|i| dir.path().join(format!("part_{i:03}.mkv"))).collect();
    for part in &parts {
        synth_clip(&ffmpeg, part, 1).await;
    }

    let joined = dir.path().join("joined.mkv");
    let cancel = CancellationToken::new();
    concat_parts(&tools, &parts, &joined, &cancel).await.unwrap();
    assert!(joined.exists());

    let rendition = dir.path().join("video");
    let playlist = rendition.join("index.m3u8");
    let muxer_args: Vec<String> = [
        "-f",
        "hls",
        "-hls_time",
        "1",
        "-hls_playlist_type",
        "vod",
        "-hls_segment_type",
        "mpegts",
        "-hls_segment_filename",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain(std::iter::once(rendition.join("seg_%05d.ts").to_string_lossy().into_owned()))
    .collect();
    package_hls(&tools, &joined, &playlist, &muxer_args, &cancel).await.unwrap();

    let text = std::fs::read_to_string(&playlist).unwrap();
    assert!(text.contains("#EXTINF"));
    assert!(text.contains("#EXT-X-ENDLIST"));
    assert!(rendition.join("seg_00000.ts").exists());
}
