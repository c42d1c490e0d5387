//! Media (rendition) playlists.
//!
//! ffmpeg writes the media playlists for audio and video renditions itself;
//! these types read them back for output validation and bandwidth
//! measurement, and write the single-segment playlists used for WebVTT
//! subtitle renditions.

use std::fmt::{self, Write as _};
use std::time::Duration;

use ef_core::{Error, Result};
use serde::Serialize;

/// Media playlist for a single rendition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaPlaylist {
    /// Target duration in seconds.
    pub target_duration: u32,
    pub media_sequence: u64,
    /// Init segment URI (fMP4 only).
    pub init_uri: Option<String>,
    pub segments: Vec<SegmentEntry>,
    /// Whether the playlist carries `#EXT-X-ENDLIST`.
    pub ended: bool,
}

/// A segment entry in the playlist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentEntry {
    /// Duration in seconds.
    pub duration: f64,
    pub uri: String,
    pub title: Option<String>,
    /// Discontinuity before this segment.
    pub discontinuity: bool,
}

impl SegmentEntry {
    pub fn new(duration: f64, uri: impl Into<String>) -> Self {
        Self {
            duration,
            uri: uri.into(),
            title: None,
            discontinuity: false,
        }
    }
}

impl Default for MediaPlaylist {
    fn default() -> Self {
        Self::vod()
    }
}

impl MediaPlaylist {
    /// Empty ended VOD playlist.
    pub fn vod() -> Self {
        Self {
            target_duration: 6,
            media_sequence: 0,
            init_uri: None,
            segments: Vec::new(),
            ended: true,
        }
    }

    /// Playlist with one segment spanning the whole asset, as used for
    /// WebVTT subtitle renditions.
    pub fn single_file(uri: impl Into<String>, duration: Duration) -> Self {
        let secs = duration.as_secs_f64();
        Self {
            target_duration: secs.ceil().max(1.0) as u32,
            segments: vec![SegmentEntry::new(secs, uri)],
            ..Self::vod()
        }
    }

    pub fn push(&mut self, segment: SegmentEntry) {
        let ceil = segment.duration.ceil() as u32;
        if ceil > self.target_duration {
            self.target_duration = ceil;
        }
        self.segments.push(segment);
    }

    pub fn total_duration(&self) -> Duration {
        let secs: f64 = self.segments.iter().map(|s| s.duration).sum();
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Render to M3U8 text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "#EXTM3U")?;
        writeln!(out, "#EXT-X-VERSION:7")?;
        writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence)?;
        writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD")?;
        writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS")?;
        if let Some(init) = &self.init_uri {
            writeln!(out, "#EXT-X-MAP:URI=\"{init}\"")?;
        }
        for segment in &self.segments {
            if segment.discontinuity {
                writeln!(out, "#EXT-X-DISCONTINUITY")?;
            }
            match &segment.title {
                Some(title) => writeln!(out, "#EXTINF:{:.6},{title}", segment.duration)?,
                None => writeln!(out, "#EXTINF:{:.6},", segment.duration)?,
            }
            writeln!(out, "{}", segment.uri)?;
        }
        if self.ended {
            writeln!(out, "#EXT-X-ENDLIST")?;
        }
        Ok(())
    }

    /// Parse a media playlist as written by ffmpeg's HLS muxer.
    ///
    /// Unknown tags are ignored. A master playlist is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("#EXTM3U") {
            return Err(Error::Manifest("missing #EXTM3U header".into()));
        }

        let mut playlist = Self {
            ended: false,
            target_duration: 0,
            ..Self::vod()
        };
        let mut pending: Option<(f64, Option<String>)> = None;
        let mut discontinuity = false;

        for line in lines {
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let (dur, title) = rest.split_once(',').unwrap_or((rest, ""));
                let duration: f64 = dur
                    .trim()
                    .parse()
                    .map_err(|_| Error::Manifest(format!("bad EXTINF duration: {dur}")))?;
                let title = (!title.is_empty()).then(|| title.to_string());
                pending = Some((duration, title));
            } else if let Some(v) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = v
                    .parse()
                    .map_err(|_| Error::Manifest(format!("bad target duration: {v}")))?;
            } else if let Some(v) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                playlist.media_sequence = v
                    .parse()
                    .map_err(|_| Error::Manifest(format!("bad media sequence: {v}")))?;
            } else if let Some(v) = line.strip_prefix("#EXT-X-MAP:") {
                playlist.init_uri = attribute(v, "URI");
            } else if line == "#EXT-X-DISCONTINUITY" {
                discontinuity = true;
            } else if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if line.starts_with("#EXT-X-STREAM-INF") {
                return Err(Error::Manifest("expected a media playlist, found a master playlist".into()));
            } else if line.starts_with('#') {
                continue;
            } else if let Some((duration, title)) = pending.take() {
                playlist.segments.push(SegmentEntry {
                    duration,
                    uri: line.to_string(),
                    title,
                    discontinuity: std::mem::take(&mut discontinuity),
                });
            } else {
                return Err(Error::Manifest(format!("segment URI without EXTINF: {line}")));
            }
        }
        Ok(playlist)
    }
}

/// Value of a quoted or bare attribute in an attribute list.
fn attribute(list: &str, name: &str) -> Option<String> {
    let start = list.find(&format!("{name}="))? + name.len() + 1;
    let rest = &list[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        quoted.split('"').next().map(str::to_string)
    } else {
        rest.split(',').next().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFMPEG_PLAYLIST: &str = "\
#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:6.006000,
seg_00000.m4s
#EXTINF:6.006000,
seg_00001.m4s
#EXTINF:2.502000,
seg_00002.m4s
#EXT-X-ENDLIST
";

    #[test]
    fn parses_ffmpeg_output() {
        let p = MediaPlaylist::parse(FFMPEG_PLAYLIST).unwrap();
        assert_eq!(p.target_duration, 6);
        assert_eq!(p.init_uri.as_deref(), Some("init.mp4"));
        assert_eq!(p.segments.len(), 3);
        assert_eq!(p.segments[2].uri, "seg_00002.m4s");
        assert!(p.ended);
        assert!((p.total_duration().as_secs_f64() - 14.514).abs() < 1e-6);
    }

    #[test]
    fn render_parse_is_stable() {
        let p = MediaPlaylist::parse(FFMPEG_PLAYLIST).unwrap();
        assert_eq!(p.render(), FFMPEG_PLAYLIST);
    }

    #[test]
    fn single_file_playlist() {
        let p = MediaPlaylist::single_file("subs.vtt", Duration::from_secs_f64(5400.4));
        let text = p.render();
        assert!(text.contains("#EXT-X-TARGETDURATION:5401\n"));
        assert!(text.contains("#EXTINF:5400.400000,\nsubs.vtt\n"));
        assert!(!text.contains("#EXT-X-MAP"));
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn push_raises_target_duration() {
        let mut p = MediaPlaylist::vod();
        p.push(SegmentEntry::new(4.0, "a.ts"));
        assert_eq!(p.target_duration, 6);
        p.push(SegmentEntry::new(8.3, "b.ts"));
        assert_eq!(p.target_duration, 9);
    }

    #[test]
    fn rejects_master_and_garbage() {
        assert!(MediaPlaylist::parse("not a playlist").is_err());
        assert!(MediaPlaylist::parse("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nv.m3u8\n").is_err());
        assert!(MediaPlaylist::parse("#EXTM3U\nseg.ts\n").is_err());
    }

    #[test]
    fn unterminated_playlist_is_not_ended() {
        let p = MediaPlaylist::parse("#EXTM3U\n#EXTINF:2.0,\nseg.ts\n").unwrap();
        assert!(!p.ended);
        assert_eq!(p.segments.len(), 1);
    }
}
