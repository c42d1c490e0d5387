//! Post-encode output checks and bandwidth measurement.
//!
//! A clean exit from ffmpeg is not proof of a usable artifact. Single files
//! must exist and reach a minimum size; HLS renditions must have a parseable
//! media playlist with at least one segment, and every segment it lists
//! must exist.

use std::path::Path;
use std::time::Duration;

use ef_core::{Error, Result};
use ef_manifest::MediaPlaylist;

/// What validation learned about an artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputStats {
    /// Total bytes, including segments and init segment.
    pub bytes: u64,
    pub segments: usize,
    /// Playlist duration, for segmented outputs.
    pub duration: Option<Duration>,
    /// Highest per-segment bitrate in bits per second.
    pub peak_bandwidth: Option<u64>,
    /// Overall bitrate in bits per second.
    pub average_bandwidth: Option<u64>,
}

/// Validate the artifact at `path`. `.m3u8` paths are treated as HLS media
/// playlists.
pub fn validate_output(path: &Path, min_bytes: u64) -> Result<OutputStats> {
    let stats = if is_playlist(path) {
        validate_playlist(path)?
    } else {
        let bytes = file_size(path)?;
        OutputStats {
            bytes,
            segments: 0,
            ..Default::default()
        }
    };
    if stats.bytes < min_bytes {
        return Err(Error::OutputValidation(format!(
            "{} is {} bytes, expected at least {min_bytes}",
            path.display(),
            stats.bytes
        )));
    }
    tracing::debug!(
        path = %path.display(),
        bytes = stats.bytes,
        segments = stats.segments,
        "Output validated"
    );
    Ok(stats)
}

fn validate_playlist(path: &Path) -> Result<OutputStats> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::OutputValidation(format!("cannot read playlist {}: {e}", path.display()))
    })?;
    let playlist = MediaPlaylist::parse(&text)
        .map_err(|e| Error::OutputValidation(format!("{}: {e}", path.display())))?;
    if playlist.segments.is_empty() {
        return Err(Error::OutputValidation(format!(
            "{} lists no segments",
            path.display()
        )));
    }

    let dir = path.parent().unwrap_or(Path::new("."));
    let mut bytes = match &playlist.init_uri {
        Some(init) => file_size(&dir.join(init))?,
        None => 0,
    };
    let mut peak: Option<u64> = None;
    for segment in &playlist.segments {
        let size = file_size(&dir.join(&segment.uri))?;
        bytes += size;
        if let Some(bw) = bandwidth(size, segment.duration) {
            peak = Some(peak.map_or(bw, |p| p.max(bw)));
        }
    }
    let duration = playlist.total_duration();
    Ok(OutputStats {
        bytes,
        segments: playlist.segments.len(),
        duration: Some(duration),
        peak_bandwidth: peak,
        average_bandwidth: bandwidth(bytes, duration.as_secs_f64()),
    })
}

/// Bits per second for `bytes` over `secs`, `None` for empty durations.
pub fn bandwidth(bytes: u64, secs: f64) -> Option<u64> {
    (secs > 0.0).then(|| (bytes as f64 * 8.0 / secs).round() as u64)
}

fn file_size(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::OutputValidation(format!("missing output {}: {e}", path.display())))
}

fn is_playlist(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "m3u8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn write_playlist(dir: &Path, segments: &[(f64, usize)]) -> std::path::PathBuf {
        let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MAP:URI=\"init.mp4\"\n");
        std::fs::write(dir.join("init.mp4"), vec![0u8; 100]).unwrap();
        for (i, (dur, size)) in segments.iter().enumerate() {
            let name = format!("seg_{i:05}.m4s");
            std::fs::write(dir.join(&name), vec![0u8; *size]).unwrap();
            text.push_str(&format!("#EXTINF:{dur},\n{name}\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        let path = dir.join("index.m3u8");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn single_file_size_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        assert_eq!(validate_output(&path, 1024).unwrap().bytes, 2048);
        assert_matches!(validate_output(&path, 4096), Err(Error::OutputValidation(_)));
        assert_matches!(
            validate_output(&dir.path().join("missing.mp4"), 1),
            Err(Error::OutputValidation(_))
        );
    }

    #[test]
    fn playlist_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_playlist(dir.path(), &[(4.0, 2000), (2.0, 2000)]);
        let stats = validate_output(&path, 1024).unwrap();
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.bytes, 4100);
        assert_eq!(stats.duration, Some(Duration::from_secs(6)));
        assert_eq!(stats.peak_bandwidth, Some(8000));
        assert_eq!(stats.average_bandwidth, Some(5467));
    }

    #[test]
    fn empty_or_broken_playlists_fail() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write_playlist(dir.path(), &[]);
        assert_matches!(validate_output(&empty, 0), Err(Error::OutputValidation(_)));

        let path = write_playlist(dir.path(), &[(6.0, 5000)]);
        std::fs::remove_file(dir.path().join("seg_00000.m4s")).unwrap();
        assert_matches!(validate_output(&path, 0), Err(Error::OutputValidation(_)));

        std::fs::write(&path, "not a playlist").unwrap();
        assert_matches!(validate_output(&path, 0), Err(Error::OutputValidation(_)));
    }
}
