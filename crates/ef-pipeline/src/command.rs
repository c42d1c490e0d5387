//! ffmpeg invocations for leaf tasks.
//!
//! Every command streams machine-readable progress on stdout
//! (`-progress pipe:1`) and keeps stderr for diagnostics. Argument order is
//! fixed: global flags, hardware input flags, seek, input, mapping, filters,
//! codec arguments, threads, muxer arguments, user arguments, destination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ef_av::ToolCommand;
use ef_codec::codec::subtitle_encoder;
use ef_codec::{AudioOutput, ContainerConfig, ScaleMode, VideoCodecConfig, VideoOutput};
use ef_core::{Error, HwAccel, Result, SubtitleCodec, VideoCodec};
use ef_dispatch::SegmentRange;
use ef_probe::types::language_matches;
use ef_probe::{MediaInfo, SubtitleTrack, VideoTrack};

const GLOBAL_ARGS: [&str; 6] = ["-y", "-hide_banner", "-nostdin", "-progress", "pipe:1", "-nostats"];

const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

const TONEMAP_FILTER: &str = "zscale=t=linear:npl=100,format=gbrpf32le,zscale=p=bt709,\
tonemap=tonemap=hable:desat=0,zscale=t=bt709:m=bt709:r=tv,format=yuv420p";

/// Process limits applied to every command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg: PathBuf,
    timeout: Duration,
    tail_lines: usize,
}

/// Source subtitle rendered into the picture.
#[derive(Debug, Clone, Copy)]
pub struct BurnIn<'a> {
    /// Position among the source's subtitle streams (`si=` of the filter).
    pub relative_index: usize,
    pub track: &'a SubtitleTrack,
}

/// One video rendition (or one part of it).
#[derive(Debug, Clone)]
pub struct VideoEncode<'a> {
    pub input: &'a Path,
    pub source: &'a VideoTrack,
    pub output: &'a VideoOutput,
    pub segment: Option<&'a SegmentRange>,
    pub hw: HwAccel,
    pub threads: Option<u32>,
    pub two_pass: bool,
    pub burn_in: Option<BurnIn<'a>>,
    /// Profile-wide arguments placed right before the destination.
    pub custom_args: &'a [String],
    /// Container of `destination`.
    pub container: &'a ContainerConfig,
    pub destination: &'a Path,
    /// Pass log prefix for two-pass encodes.
    pub passlog: &'a Path,
}

/// One audio rendition.
#[derive(Debug, Clone)]
pub struct AudioEncode<'a> {
    pub input: &'a Path,
    pub stream_index: u32,
    pub language: Option<&'a str>,
    pub title: Option<&'a str>,
    pub output: &'a AudioOutput,
    pub threads: Option<u32>,
    pub container: &'a ContainerConfig,
    pub destination: &'a Path,
}

/// One subtitle rendition.
#[derive(Debug, Clone)]
pub struct SubtitleEncode<'a> {
    pub input: &'a Path,
    pub stream_index: u32,
    pub language: Option<&'a str>,
    pub codec: SubtitleCodec,
    pub destination: &'a Path,
}

impl CommandBuilder {
    pub fn new(ffmpeg: impl Into<PathBuf>, timeout: Duration, tail_lines: usize) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            timeout,
            tail_lines,
        }
    }

    fn base(&self) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.timeout(self.timeout).tail_lines(self.tail_lines);
        cmd.args(GLOBAL_ARGS);
        cmd
    }

    /// Commands for a video encode: one, or two for a two-pass encode.
    pub fn video(&self, enc: &VideoEncode<'_>) -> Vec<ToolCommand> {
        let two_pass = enc.two_pass && !enc.hw.is_hardware();
        if !two_pass {
            return vec![self.video_pass(enc, None)];
        }
        vec![self.video_pass(enc, Some(1)), self.video_pass(enc, Some(2))]
    }

    fn video_pass(&self, enc: &VideoEncode<'_>, pass: Option<u8>) -> ToolCommand {
        let mut cmd = self.base();
        cmd.args(hwaccel_input_args(enc.hw));
        if let Some(seg) = enc.segment {
            cmd.args(["-ss".to_string(), seconds(seg.start)]);
        }
        cmd.arg("-i").path_arg(enc.input);
        if let Some(d) = enc.segment.and_then(|s| s.duration) {
            cmd.args(["-t".to_string(), seconds(d)]);
        }
        cmd.args(["-map".to_string(), format!("0:{}", enc.source.index)]);

        let filters = video_filters(enc);
        if !filters.is_empty() {
            cmd.arg("-vf").arg(filters.join(","));
        }
        cmd.args(enc.output.codec.args(enc.hw));
        if let Some(threads) = enc.threads {
            cmd.args(["-threads".to_string(), threads.to_string()]);
        }
        if let Some(pass) = pass {
            cmd.args(pass_args(&enc.output.codec, pass, enc.passlog));
        }

        if pass == Some(1) {
            cmd.args(["-an", "-f", "null", "-"]);
            return cmd;
        }
        let variant_dir = enc.destination.parent().unwrap_or(Path::new("."));
        cmd.args(enc.container.muxer_args(variant_dir));
        cmd.args(enc.output.extra_args.iter().cloned());
        cmd.args(enc.custom_args.iter().cloned());
        cmd.path_arg(enc.destination);
        cmd
    }

    pub fn audio(&self, enc: &AudioEncode<'_>) -> ToolCommand {
        let mut cmd = self.base();
        cmd.arg("-i").path_arg(enc.input);
        cmd.args(["-map".to_string(), format!("0:{}", enc.stream_index)]);
        cmd.args(enc.output.codec.args());
        if let Some(lang) = enc.language {
            cmd.args(["-metadata:s:a:0".to_string(), format!("language={lang}")]);
        }
        if let Some(title) = enc.title {
            cmd.args(["-metadata:s:a:0".to_string(), format!("title={title}")]);
        }
        if let Some(threads) = enc.threads {
            cmd.args(["-threads".to_string(), threads.to_string()]);
        }
        let variant_dir = enc.destination.parent().unwrap_or(Path::new("."));
        cmd.args(enc.container.muxer_args(variant_dir));
        cmd.args(enc.output.extra_args.iter().cloned());
        cmd.path_arg(enc.destination);
        cmd
    }

    /// Convert one subtitle stream into a standalone file.
    pub fn subtitle(&self, enc: &SubtitleEncode<'_>) -> Result<ToolCommand> {
        let encoder = subtitle_encoder(enc.codec).ok_or_else(|| {
            Error::validation(format!("{} subtitles cannot be encoded", enc.codec))
        })?;
        let mut cmd = self.base();
        cmd.arg("-i").path_arg(enc.input);
        cmd.args(["-map".to_string(), format!("0:{}", enc.stream_index)]);
        cmd.args(["-c:s", encoder]);
        if let Some(lang) = enc.language {
            cmd.args(["-metadata:s:s:0".to_string(), format!("language={lang}")]);
        }
        cmd.path_arg(enc.destination);
        Ok(cmd)
    }
}

/// Flags placed before `-i` for a hardware encoder.
///
/// Decoding stays in system memory so software filters keep working; VAAPI
/// frames are uploaded at the end of the filter chain instead.
pub fn hwaccel_input_args(hw: HwAccel) -> Vec<&'static str> {
    match hw {
        HwAccel::None => vec![],
        HwAccel::Nvenc => vec!["-hwaccel", "cuda"],
        HwAccel::Qsv => vec!["-hwaccel", "qsv"],
        HwAccel::Vaapi => vec!["-vaapi_device", VAAPI_DEVICE],
        HwAccel::VideoToolbox => vec!["-hwaccel", "videotoolbox"],
    }
}

fn pass_args(codec: &VideoCodecConfig, pass: u8, passlog: &Path) -> Vec<String> {
    let log = passlog.to_string_lossy();
    match codec.kind() {
        // libx265 takes its pass settings through x265-params.
        VideoCodec::H265 => vec![
            "-x265-params".to_string(),
            format!("pass={pass}:stats={log}.log"),
        ],
        _ => vec![
            "-pass".to_string(),
            pass.to_string(),
            "-passlogfile".to_string(),
            log.into_owned(),
        ],
    }
}

/// The `-vf` chain: scale, tone map, burn-in, user filters, hardware upload.
pub fn video_filters(enc: &VideoEncode<'_>) -> Vec<String> {
    let mut filters = Vec::new();
    if let Some(scale) = scale_filter(enc.output, enc.source.width, enc.source.height) {
        filters.push(scale);
    }
    if enc.output.tone_map && enc.source.hdr_format.is_hdr() {
        filters.push(TONEMAP_FILTER.to_string());
    }
    if let Some(burn) = enc.burn_in {
        let subs = format!(
            "subtitles=filename={}:si={}",
            escape_filter_value(&enc.input.to_string_lossy()),
            burn.relative_index
        );
        match enc.segment.filter(|s| !s.start.is_zero()) {
            // Input seeking resets timestamps; shift them back for the
            // subtitle renderer, which reads the file from the start.
            Some(seg) => {
                let offset = seconds(seg.start);
                filters.push(format!("setpts=PTS+{offset}/TB"));
                filters.push(subs);
                filters.push("setpts=PTS-STARTPTS".to_string());
            }
            None => filters.push(subs),
        }
    }
    filters.extend(enc.output.filters.iter().cloned());
    if enc.hw == HwAccel::Vaapi {
        filters.push("format=nv12,hwupload".to_string());
    }
    filters
}

/// Target dimensions of a rendition for a `src_w`×`src_h` source, rounded
/// to even values.
pub fn output_dimensions(output: &VideoOutput, src_w: u32, src_h: u32) -> (u32, u32) {
    let (sw, sh) = (f64::from(src_w.max(1)), f64::from(src_h.max(1)));
    let (w, h) = match (output.width, output.height, output.scale_mode) {
        (None, None, _) => (sw, sh),
        (Some(w), None, _) => (f64::from(w), sh * f64::from(w) / sw),
        (None, Some(h), _) => (sw * f64::from(h) / sh, f64::from(h)),
        (Some(w), Some(h), ScaleMode::Fit) => {
            let factor = (f64::from(w) / sw).min(f64::from(h) / sh);
            (sw * factor, sh * factor)
        }
        (Some(w), Some(h), ScaleMode::Fill | ScaleMode::Stretch) => (f64::from(w), f64::from(h)),
    };
    (even(w), even(h))
}

fn even(v: f64) -> u32 {
    let rounded = (v / 2.0).round() as u32 * 2;
    rounded.max(2)
}

/// Scale (and crop) filter, or `None` when the source already has the
/// target dimensions.
pub fn scale_filter(output: &VideoOutput, src_w: u32, src_h: u32) -> Option<String> {
    let (w, h) = output_dimensions(output, src_w, src_h);
    if (w, h) == (src_w, src_h) {
        return None;
    }
    let filter = match output.scale_mode {
        ScaleMode::Fill if output.width.is_some() && output.height.is_some() => {
            format!("scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}")
        }
        _ => format!("scale={w}:{h}"),
    };
    Some(filter)
}

/// Pick the subtitle track to burn in: a text track whose language matches,
/// forced tracks first when `include_forced` is set.
pub fn select_burn_in<'a>(
    media: &'a MediaInfo,
    languages: &[String],
    include_forced: bool,
) -> Option<BurnIn<'a>> {
    let candidates = media
        .subtitle_tracks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_text() && language_matches(t.language.as_deref(), languages));
    let mut best: Option<(usize, &SubtitleTrack)> = None;
    for (i, track) in candidates {
        let preferred = track.forced == include_forced;
        match best {
            Some((_, b)) if (b.forced == include_forced) || !preferred => {}
            _ => best = Some((i, track)),
        }
    }
    best.map(|(relative_index, track)| BurnIn {
        relative_index,
        track,
    })
}

fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':' | '\'' | ',' | '[' | ']' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn seconds(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_codec::container::HlsSettings;
    use ef_codec::store::builtin_profiles;
    use ef_probe::fixtures;

    fn builder() -> CommandBuilder {
        CommandBuilder::new("ffmpeg", Duration::from_secs(60), 10)
    }

    fn rung(width: Option<u32>, height: Option<u32>, mode: ScaleMode) -> VideoOutput {
        VideoOutput {
            width,
            height,
            scale_mode: mode,
            ..builtin_profiles()[0].video[0].clone()
        }
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("{needle} missing from {args:?}"))
    }

    #[test]
    fn dimensions_follow_scale_mode() {
        let fit = rung(Some(1280), Some(720), ScaleMode::Fit);
        assert_eq!(output_dimensions(&fit, 1920, 800), (1280, 534));
        assert_eq!(output_dimensions(&rung(None, Some(720), ScaleMode::Fit), 1920, 1080), (1280, 720));
        assert_eq!(output_dimensions(&rung(Some(853), None, ScaleMode::Fit), 1920, 1080), (854, 480));
        assert_eq!(output_dimensions(&rung(None, None, ScaleMode::Fit), 1920, 1080), (1920, 1080));

        let fill = rung(Some(1280), Some(720), ScaleMode::Fill);
        assert_eq!(output_dimensions(&fill, 1920, 800), (1280, 720));
        assert_eq!(
            scale_filter(&fill, 1920, 800).unwrap(),
            "scale=1280:720:force_original_aspect_ratio=increase,crop=1280:720"
        );
        assert_eq!(
            scale_filter(&rung(Some(1280), Some(720), ScaleMode::Stretch), 1920, 800).unwrap(),
            "scale=1280:720"
        );
        assert!(scale_filter(&rung(None, Some(1080), ScaleMode::Fit), 1920, 1080).is_none());
    }

    #[test]
    fn hls_video_command_shape() {
        let profile = &builtin_profiles()[0];
        let media = fixtures::sdr_1080p(Duration::from_secs(60));
        let output = &profile.video[1];
        let dest = PathBuf::from("/out/video_720p/index.m3u8");
        let enc = VideoEncode {
            input: Path::new("/media/in.mkv"),
            source: media.primary_video().unwrap(),
            output,
            segment: None,
            hw: HwAccel::None,
            threads: Some(4),
            two_pass: false,
            burn_in: None,
            custom_args: &["-map_chapters".to_string(), "-1".to_string()],
            container: &profile.container,
            destination: &dest,
            passlog: Path::new("/tmp/pass"),
        };
        let cmds = builder().video(&enc);
        assert_eq!(cmds.len(), 1);
        let args = cmds[0].get_args();

        assert_eq!(&args[..6], &GLOBAL_ARGS.map(String::from));
        assert!(position(args, "-i") < position(args, "-map"));
        assert_eq!(args[position(args, "-map") + 1], "0:0");
        assert_eq!(args[position(args, "-vf") + 1], "scale=1280:720");
        assert_eq!(args[position(args, "-c:v") + 1], "libx264");
        assert!(position(args, "-c:v") < position(args, "-threads"));
        assert!(position(args, "-threads") < position(args, "-hls_time"));
        assert!(position(args, "-hls_time") < position(args, "-map_chapters"));
        assert_eq!(args.last().unwrap(), "/out/video_720p/index.m3u8");
        assert!(args
            .iter()
            .any(|a| a == "/out/video_720p/seg_%05d.m4s"));
    }

    #[test]
    fn segment_seeks_before_input() {
        let profile = &builtin_profiles()[2];
        let media = fixtures::sdr_1080p(Duration::from_secs(3600));
        let seg = SegmentRange {
            index: 1,
            count: 3,
            start: Duration::from_secs(1200),
            duration: Some(Duration::from_secs(1200)),
        };
        let dest = PathBuf::from("/work/video_1080p_part_001.mkv");
        let enc = VideoEncode {
            input: Path::new("/media/in.mkv"),
            source: media.primary_video().unwrap(),
            output: &profile.video[0],
            segment: Some(&seg),
            hw: HwAccel::Nvenc,
            threads: None,
            two_pass: true,
            burn_in: None,
            custom_args: &[],
            container: &ContainerConfig::Mkv,
            destination: &dest,
            passlog: Path::new("/work/pass"),
        };
        let cmds = builder().video(&enc);
        // Hardware encoders never run two passes.
        assert_eq!(cmds.len(), 1);
        let args = cmds[0].get_args();
        assert_eq!(args[position(args, "-hwaccel") + 1], "cuda");
        assert_eq!(args[position(args, "-ss") + 1], "1200.000");
        assert!(position(args, "-ss") < position(args, "-i"));
        assert!(position(args, "-i") < position(args, "-t"));
        assert_eq!(args[position(args, "-c:v") + 1], "h264_nvenc");
        assert_eq!(args[position(args, "-f") + 1], "matroska");
    }

    #[test]
    fn two_pass_software_encode() {
        let profile = &builtin_profiles()[2];
        let media = fixtures::sdr_1080p(Duration::from_secs(60));
        let dest = PathBuf::from("/work/video_1080p.mp4");
        let enc = VideoEncode {
            input: Path::new("/media/in.mkv"),
            source: media.primary_video().unwrap(),
            output: &profile.video[0],
            segment: None,
            hw: HwAccel::None,
            threads: None,
            two_pass: true,
            burn_in: None,
            custom_args: &[],
            container: &profile.container,
            destination: &dest,
            passlog: Path::new("/work/pass"),
        };
        let cmds = builder().video(&enc);
        assert_eq!(cmds.len(), 2);
        let first = cmds[0].get_args();
        assert_eq!(first[position(first, "-pass") + 1], "1");
        assert_eq!(first.last().unwrap(), "-");
        let second = cmds[1].get_args();
        assert_eq!(second[position(second, "-pass") + 1], "2");
        assert_eq!(second[position(second, "-passlogfile") + 1], "/work/pass");
        assert_eq!(second.last().unwrap(), "/work/video_1080p.mp4");
    }

    #[test]
    fn tone_map_and_burn_in_filters() {
        let mut output = builtin_profiles()[2].video[0].clone();
        output.filters = vec!["hqdn3d".into()];
        let media = fixtures::multi_track(Duration::from_secs(60));
        let burn = select_burn_in(&media, &["eng".to_string()], false).unwrap();
        assert_eq!(burn.relative_index, 0);
        let seg = SegmentRange {
            index: 1,
            count: 2,
            start: Duration::from_secs(30),
            duration: None,
        };
        let dest = PathBuf::from("/work/x.mkv");
        let enc = VideoEncode {
            input: Path::new("/media/a:b.mkv"),
            source: media.primary_video().unwrap(),
            output: &output,
            segment: Some(&seg),
            hw: HwAccel::Vaapi,
            threads: None,
            two_pass: false,
            burn_in: Some(burn),
            custom_args: &[],
            container: &ContainerConfig::Mkv,
            destination: &dest,
            passlog: Path::new("/work/pass"),
        };
        let filters = video_filters(&enc);
        assert_eq!(filters[0], "scale=1920:1080");
        assert_eq!(filters[1], TONEMAP_FILTER);
        assert_eq!(filters[2], "setpts=PTS+30.000/TB");
        assert_eq!(filters[3], r"subtitles=filename=/media/a\:b.mkv:si=0");
        assert_eq!(filters[4], "setpts=PTS-STARTPTS");
        assert_eq!(filters[5], "hqdn3d");
        assert_eq!(filters[6], "format=nv12,hwupload");
    }

    #[test]
    fn burn_in_selection() {
        let media = fixtures::multi_track(Duration::from_secs(60));
        // Forced ASS track preferred when forced tracks are wanted.
        let forced = select_burn_in(&media, &[], true).unwrap();
        assert_eq!(forced.track.index, 5);
        assert_eq!(forced.relative_index, 1);
        // Bitmap tracks are never burned in.
        assert!(select_burn_in(&media, &["ger".to_string()], false).is_none());
        assert!(select_burn_in(&fixtures::sdr_1080p(Duration::from_secs(1)), &[], false).is_none());
    }

    #[test]
    fn audio_command_shape() {
        let profile = &builtin_profiles()[0];
        let dest = PathBuf::from("/out/audio_eng_aac_1/index.m3u8");
        let cmd = builder().audio(&AudioEncode {
            input: Path::new("/media/in.mkv"),
            stream_index: 1,
            language: Some("eng"),
            title: None,
            output: &profile.audio[0],
            threads: None,
            container: &ContainerConfig::Hls(HlsSettings::default()),
            destination: &dest,
        });
        let args = cmd.get_args();
        assert_eq!(args[position(args, "-map") + 1], "0:1");
        assert_eq!(args[position(args, "-c:a") + 1], "aac");
        assert_eq!(args[position(args, "-metadata:s:a:0") + 1], "language=eng");
        assert_eq!(args.last().unwrap(), "/out/audio_eng_aac_1/index.m3u8");
    }

    #[test]
    fn subtitle_command_shape() {
        let dest = PathBuf::from("/out/subs_eng_4/subtitles.vtt");
        let cmd = builder()
            .subtitle(&SubtitleEncode {
                input: Path::new("/media/in.mkv"),
                stream_index: 4,
                language: Some("eng"),
                codec: SubtitleCodec::WebVtt,
                destination: &dest,
            })
            .unwrap();
        let args = cmd.get_args();
        assert_eq!(args[position(args, "-c:s") + 1], "webvtt");
        assert_eq!(args[position(args, "-map") + 1], "0:4");

        let err = builder()
            .subtitle(&SubtitleEncode {
                input: Path::new("/media/in.mkv"),
                stream_index: 6,
                language: None,
                codec: SubtitleCodec::Pgs,
                destination: &dest,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
