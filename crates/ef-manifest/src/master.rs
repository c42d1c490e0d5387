//! Master playlist assembly.
//!
//! Ordering rules:
//! - audio groups follow codec order (`AudioCodec`'s `Ord`), one group per
//!   codec; entries inside a group are sorted by language, name, URI
//! - exactly one entry per audio group is `DEFAULT=YES`: the first one marked
//!   default in sorted order, or the first entry when none is marked
//! - video variants are grouped by resolution; groups are ordered by their
//!   highest bandwidth (descending), within a group SDR comes before HDR
//! - each video variant gets one `EXT-X-STREAM-INF` per audio group
//! - at most one subtitle is `DEFAULT=YES`: the first marked default in
//!   sorted order

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use ef_core::{AudioCodec, Error, Result};

use crate::codecs::codecs_attribute;
use crate::variants::{AudioVariant, QualityPlaylist, SubtitleVariant};

/// File name of the master playlist in the job output directory.
pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";

/// `EXT-X-VERSION` written to master playlists.
pub const MASTER_PLAYLIST_VERSION: u8 = 6;

const SUBTITLE_GROUP_ID: &str = "subs";

/// Group audio variants by codec family.
pub fn group_audio_by_codec(
    variants: impl IntoIterator<Item = AudioVariant>,
) -> BTreeMap<AudioCodec, Vec<AudioVariant>> {
    let mut groups: BTreeMap<AudioCodec, Vec<AudioVariant>> = BTreeMap::new();
    for v in variants {
        groups.entry(v.codec).or_default().push(v);
    }
    groups
}

struct AudioGroup<'a> {
    id: String,
    codec: AudioCodec,
    entries: Vec<&'a AudioVariant>,
    default_index: usize,
    bandwidth: u64,
}

fn build_audio_groups(audio_by_codec: &BTreeMap<AudioCodec, Vec<AudioVariant>>) -> Vec<AudioGroup<'_>> {
    audio_by_codec
        .iter()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(codec, entries)| {
            let mut entries: Vec<&AudioVariant> = entries.iter().collect();
            entries.sort_by(|a, b| {
                a.language
                    .cmp(&b.language)
                    .then_with(|| a.name.cmp(&b.name))
                    .then_with(|| a.uri.cmp(&b.uri))
                    .then_with(|| a.channels.cmp(&b.channels))
                    .then_with(|| a.bandwidth.cmp(&b.bandwidth))
                    .then_with(|| b.default.cmp(&a.default))
            });
            let default_index = entries.iter().position(|e| e.default).unwrap_or(0);
            let bandwidth = entries.iter().map(|e| e.bandwidth).max().unwrap_or(0);
            AudioGroup {
                id: format!("audio-{codec}"),
                codec: *codec,
                entries,
                default_index,
                bandwidth,
            }
        })
        .collect()
}

fn order_video(video: &[QualityPlaylist]) -> Vec<&QualityPlaylist> {
    let mut by_resolution: BTreeMap<(u32, u32), Vec<&QualityPlaylist>> = BTreeMap::new();
    for v in video {
        by_resolution.entry((v.width, v.height)).or_default().push(v);
    }

    let mut groups: Vec<((u32, u32), Vec<&QualityPlaylist>)> = by_resolution.into_iter().collect();
    for (_, variants) in &mut groups {
        variants.sort_by(|a, b| {
            a.dynamic_range
                .cmp(&b.dynamic_range)
                .then_with(|| b.bandwidth.cmp(&a.bandwidth))
                .then_with(|| a.average_bandwidth.cmp(&b.average_bandwidth))
                .then_with(|| cmp_frame_rate(a.frame_rate, b.frame_rate))
                .then_with(|| a.codecs.cmp(&b.codecs))
                .then_with(|| a.uri.cmp(&b.uri))
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    let peak = |vs: &[&QualityPlaylist]| vs.iter().map(|v| v.bandwidth).max().unwrap_or(0);
    groups.sort_by(|(res_a, a), (res_b, b)| {
        peak(b)
            .cmp(&peak(a))
            .then_with(|| res_b.1.cmp(&res_a.1))
            .then_with(|| res_b.0.cmp(&res_a.0))
    });

    groups.into_iter().flat_map(|(_, vs)| vs).collect()
}

fn cmp_frame_rate(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        _ => a.is_some().cmp(&b.is_some()),
    }
}

fn quoted(value: &str) -> String {
    value.replace('"', "'")
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

/// Render the master playlist text.
///
/// Fails when there are no video variants, or when a variant has no URI;
/// neither can produce a playable manifest.
pub fn render_master(
    video: &[QualityPlaylist],
    audio_by_codec: &BTreeMap<AudioCodec, Vec<AudioVariant>>,
    subtitles: &[SubtitleVariant],
) -> Result<String> {
    if video.is_empty() {
        return Err(Error::Manifest("no video variants to assemble".into()));
    }
    if let Some(v) = video.iter().find(|v| v.uri.is_empty()) {
        return Err(Error::Manifest(format!("video variant '{}' has no playlist", v.name)));
    }
    if let Some(a) = audio_by_codec.values().flatten().find(|a| a.uri.is_empty()) {
        return Err(Error::Manifest(format!("audio variant '{}' has no playlist", a.name)));
    }

    let groups = build_audio_groups(audio_by_codec);
    let mut subs: Vec<&SubtitleVariant> = subtitles.iter().collect();
    subs.sort_by(|a, b| {
        a.language
            .cmp(&b.language)
            .then_with(|| a.forced.cmp(&b.forced))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.uri.cmp(&b.uri))
            .then_with(|| b.default.cmp(&a.default))
    });
    let video = order_video(video);

    let mut out = String::new();
    write_master(&mut out, &video, &groups, &subs)
        .map_err(|e| Error::Internal(format!("failed to render master playlist: {e}")))?;
    Ok(out)
}

fn write_master(
    out: &mut String,
    video: &[&QualityPlaylist],
    groups: &[AudioGroup<'_>],
    subs: &[&SubtitleVariant],
) -> fmt::Result {
    writeln!(out, "#EXTM3U")?;
    writeln!(out, "#EXT-X-VERSION:{MASTER_PLAYLIST_VERSION}")?;
    writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS")?;

    if !groups.is_empty() {
        writeln!(out)?;
    }
    for group in groups {
        for (i, entry) in group.entries.iter().enumerate() {
            write!(out, "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{}\"", group.id)?;
            if let Some(lang) = &entry.language {
                write!(out, ",LANGUAGE=\"{}\"", quoted(lang))?;
            }
            write!(out, ",NAME=\"{}\"", quoted(&entry.name))?;
            if let Some(ch) = entry.channels {
                write!(out, ",CHANNELS=\"{ch}\"")?;
            }
            let is_default = i == group.default_index;
            writeln!(
                out,
                ",DEFAULT={},AUTOSELECT=YES,URI=\"{}\"",
                yes_no(is_default),
                quoted(&entry.uri)
            )?;
        }
    }

    if !subs.is_empty() {
        writeln!(out)?;
    }
    let default_sub = subs.iter().position(|s| s.default);
    for (i, sub) in subs.iter().enumerate() {
        write!(out, "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"{SUBTITLE_GROUP_ID}\"")?;
        if let Some(lang) = &sub.language {
            write!(out, ",LANGUAGE=\"{}\"", quoted(lang))?;
        }
        write!(out, ",NAME=\"{}\"", quoted(&sub.name))?;
        write!(out, ",DEFAULT={},AUTOSELECT=YES", yes_no(default_sub == Some(i)))?;
        if sub.forced {
            write!(out, ",FORCED=YES")?;
        }
        writeln!(out, ",URI=\"{}\"", quoted(&sub.uri))?;
    }

    writeln!(out)?;
    for v in video {
        if groups.is_empty() {
            write_stream_inf(out, v, None, !subs.is_empty())?;
        } else {
            for group in groups {
                write_stream_inf(out, v, Some(group), !subs.is_empty())?;
            }
        }
    }
    Ok(())
}

fn write_stream_inf(
    out: &mut String,
    v: &QualityPlaylist,
    group: Option<&AudioGroup<'_>>,
    has_subtitles: bool,
) -> fmt::Result {
    let audio_bw = group.map_or(0, |g| g.bandwidth);
    write!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", v.bandwidth + audio_bw)?;
    if let Some(avg) = v.average_bandwidth {
        write!(out, ",AVERAGE-BANDWIDTH={}", avg + audio_bw)?;
    }
    write!(out, ",RESOLUTION={}x{}", v.width, v.height)?;
    if let Some(fps) = v.frame_rate {
        write!(out, ",FRAME-RATE={fps:.3}")?;
    }
    write!(
        out,
        ",CODECS=\"{}\"",
        codecs_attribute(&v.codecs, group.map(|g| g.codec))
    )?;
    write!(out, ",VIDEO-RANGE={}", v.dynamic_range.as_attribute())?;
    if let Some(g) = group {
        write!(out, ",AUDIO=\"{}\"", g.id)?;
    }
    if has_subtitles {
        write!(out, ",SUBTITLES=\"{SUBTITLE_GROUP_ID}\"")?;
    }
    writeln!(out)?;
    writeln!(out, "{}", v.uri)
}

/// Render and atomically write `master.m3u8` into `output_dir`.
pub fn assemble_master(
    output_dir: &Path,
    video: &[QualityPlaylist],
    audio_by_codec: &BTreeMap<AudioCodec, Vec<AudioVariant>>,
    subtitles: &[SubtitleVariant],
) -> Result<PathBuf> {
    let text = render_master(video, audio_by_codec, subtitles)?;
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(MASTER_PLAYLIST_NAME);

    let mut tmp = tempfile::NamedTempFile::new_in(output_dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.persist(&path).map_err(|e| Error::from(e.error))?;

    tracing::info!(
        path = %path.display(),
        video = video.len(),
        audio_groups = audio_by_codec.values().filter(|v| !v.is_empty()).count(),
        subtitles = subtitles.len(),
        "Wrote master playlist"
    );
    Ok(path)
}
