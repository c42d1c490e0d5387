//! ffmpeg progress parsing.
//!
//! Two formats are understood:
//! - classic stats lines on stderr:
//!   `frame= 1234 fps= 48 q=28.0 size=   10240kB time=00:00:51.47 bitrate=1629.9kbits/s speed=2.01x`
//! - `-progress pipe:1` key/value blocks, each terminated by
//!   `progress=continue` or `progress=end`
//!
//! The parser is fed every output line and returns a snapshot whenever a
//! stats line or a complete key/value block has been seen. The checked-in
//! fixtures under `tests/fixtures/` pin the formats.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid regex"));
static FPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"fps=\s*([\d.]+)").expect("valid regex"));
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"size=\s*(\d+)\s*(B|kB|KiB|mB|MiB|MB)?").expect("valid regex"));
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(-?)(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex"));
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bitrate=\s*([\d.]+)\s*kbits/s").expect("valid regex"));
static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("valid regex"));

/// A progress reading derived from ffmpeg output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Completion percentage, 0–100, never decreasing within one run.
    pub percentage: f64,
    pub encoded_frames: Option<u64>,
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
    /// Output timestamp reached so far.
    pub current_time: Option<Duration>,
    pub total_duration: Option<Duration>,
    /// Bytes written so far.
    pub output_size: Option<u64>,
    pub eta: Option<Duration>,
    /// Set by `progress=end`.
    pub finished: bool,
}

/// Stateful parser for one ffmpeg run.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_frames: Option<u64>,
    total_duration: Option<Duration>,
    block: ProgressSnapshot,
    last_percentage: f64,
}

impl ProgressParser {
    /// `total_frames` is the expected frame count for the encoded range, when
    /// known; `total_duration` is the length of the encoded range.
    pub fn new(total_frames: Option<u64>, total_duration: Option<Duration>) -> Self {
        Self {
            total_frames: total_frames.filter(|f| *f > 0),
            total_duration: total_duration.filter(|d| !d.is_zero()),
            block: ProgressSnapshot::default(),
            last_percentage: 0.0,
        }
    }

    /// Feed one output line. Returns a snapshot when the line completes one.
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some((key, value)) = key_value(line) {
            return self.apply_key_value(key, value);
        }
        if is_stats_line(line) {
            let snapshot = parse_stats_line(line);
            return Some(self.finish(snapshot));
        }
        None
    }

    fn apply_key_value(&mut self, key: &str, value: &str) -> Option<ProgressSnapshot> {
        let b = &mut self.block;
        match key {
            "frame" => b.encoded_frames = value.parse().ok(),
            "fps" => b.fps = value.parse().ok().filter(|f: &f64| *f > 0.0),
            "bitrate" => {
                b.bitrate_kbps = value.trim_end_matches("kbits/s").trim().parse().ok();
            }
            "total_size" => b.output_size = value.parse().ok(),
            // `out_time_ms` is microseconds as well; prefer `out_time_us`.
            "out_time_us" => {
                b.current_time = value.parse::<u64>().ok().map(Duration::from_micros);
            }
            "out_time_ms" if b.current_time.is_none() => {
                b.current_time = value.parse::<u64>().ok().map(Duration::from_micros);
            }
            "out_time" if b.current_time.is_none() => b.current_time = parse_timestamp(value),
            "speed" => b.speed = value.trim_end_matches('x').trim().parse().ok(),
            "progress" => {
                let mut snapshot = std::mem::take(&mut self.block);
                snapshot.finished = value == "end";
                return Some(self.finish(snapshot));
            }
            _ => {}
        }
        None
    }

    fn finish(&mut self, mut s: ProgressSnapshot) -> ProgressSnapshot {
        s.total_frames = self.total_frames;
        s.total_duration = self.total_duration;

        let by_frames = match (s.encoded_frames, self.total_frames) {
            (Some(done), Some(total)) if done > 0 => Some(done as f64 / total as f64 * 100.0),
            _ => None,
        };
        let by_time = match (s.current_time, self.total_duration) {
            (Some(t), Some(total)) => Some(t.as_secs_f64() / total.as_secs_f64() * 100.0),
            _ => None,
        };
        let raw = if s.finished {
            100.0
        } else {
            by_frames.or(by_time).unwrap_or(self.last_percentage)
        };
        let pct = raw.clamp(0.0, 100.0).max(self.last_percentage);
        self.last_percentage = pct;
        s.percentage = pct;

        s.eta = estimate_eta(&s, self.total_frames, self.total_duration);
        s
    }
}

fn estimate_eta(s: &ProgressSnapshot, total_frames: Option<u64>, total: Option<Duration>) -> Option<Duration> {
    if s.finished {
        return Some(Duration::ZERO);
    }
    if let (Some(speed), Some(total), Some(done)) = (s.speed, total, s.current_time) {
        if speed > 0.0 {
            let remaining = (total.as_secs_f64() - done.as_secs_f64()).max(0.0);
            return Some(Duration::from_secs_f64(remaining / speed));
        }
    }
    if let (Some(fps), Some(total), Some(done)) = (s.fps, total_frames, s.encoded_frames) {
        if fps > 0.0 {
            let remaining = total.saturating_sub(done) as f64;
            return Some(Duration::from_secs_f64(remaining / fps));
        }
    }
    None
}

/// `-progress` lines are a single bare `key=value` with no whitespace.
fn key_value(line: &str) -> Option<(&str, &str)> {
    if line.contains(char::is_whitespace) {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    if key.is_empty()
        || value.contains('=')
        || !key.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return None;
    }
    Some((key, value))
}

fn is_stats_line(line: &str) -> bool {
    (line.starts_with("frame=") || line.starts_with("size=")) && line.contains("time=")
}

fn parse_stats_line(line: &str) -> ProgressSnapshot {
    ProgressSnapshot {
        encoded_frames: capture(&FRAME_RE, line).and_then(|v| v.parse().ok()),
        fps: capture(&FPS_RE, line).and_then(|v| v.parse().ok()).filter(|f: &f64| *f > 0.0),
        bitrate_kbps: capture(&BITRATE_RE, line).and_then(|v| v.parse().ok()),
        speed: capture(&SPEED_RE, line).and_then(|v| v.parse().ok()),
        current_time: TIME_RE.captures(line).and_then(|c| {
            if !c.get(1)?.as_str().is_empty() {
                return Some(Duration::ZERO);
            }
            let h: u64 = c.get(2)?.as_str().parse().ok()?;
            let m: u64 = c.get(3)?.as_str().parse().ok()?;
            let s: f64 = c.get(4)?.as_str().parse().ok()?;
            Some(Duration::from_secs(h * 3600 + m * 60) + Duration::from_secs_f64(s))
        }),
        output_size: SIZE_RE.captures(line).and_then(|c| {
            let n: u64 = c.get(1)?.as_str().parse().ok()?;
            let mult = match c.get(2).map(|m| m.as_str()) {
                Some("kB") | Some("KiB") => 1024,
                Some("mB") | Some("MiB") | Some("MB") => 1024 * 1024,
                _ => 1,
            };
            Some(n * mult)
        }),
        ..Default::default()
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Parse `HH:MM:SS.micro` as written by `-progress`.
fn parse_timestamp(value: &str) -> Option<Duration> {
    let mut parts = value.splitn(3, ':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    (s >= 0.0).then(|| Duration::from_secs(h * 3600 + m * 60) + Duration::from_secs_f64(s))
}
