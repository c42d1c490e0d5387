//! Task distribution strategies.
//!
//! The split strategy decides whether a video output is encoded as one task
//! or as several time ranges in parallel; the node strategy constrains which
//! nodes may pick up a job's tasks.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ef_core::config::DispatcherConfig;
use ef_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::model::SegmentRange;

/// How video outputs are divided into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Split long sources across the available nodes.
    #[default]
    Optimal,
    /// One task per video output.
    None,
    /// Exactly this many ranges per video output.
    Segments(u32),
}

impl SplitStrategy {
    /// Number of ranges to encode one video output in.
    ///
    /// Sources of unknown duration are never split.
    pub fn segment_count(
        &self,
        duration: Option<Duration>,
        node_count: usize,
        config: &DispatcherConfig,
    ) -> u32 {
        let Some(duration) = duration.filter(|d| !d.is_zero()) else {
            return 1;
        };
        match *self {
            Self::None => 1,
            Self::Segments(n) => n.max(1),
            Self::Optimal => {
                let secs = duration.as_secs();
                if config.split_min_segment_secs == 0 || secs < config.split_min_duration_secs {
                    return 1;
                }
                let by_length = secs / config.split_min_segment_secs;
                let nodes = node_count.max(1) as u64;
                let max = u64::from(config.split_max_segments.max(1));
                nodes.min(by_length).min(max).max(1) as u32
            }
        }
    }
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Optimal => f.write_str("optimal"),
            Self::None => f.write_str("none"),
            Self::Segments(n) => write!(f, "segments:{n}"),
        }
    }
}

impl FromStr for SplitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "optimal" | "auto" => Ok(Self::Optimal),
            "none" | "off" => Ok(Self::None),
            other => {
                let n = other
                    .strip_prefix("segments:")
                    .ok_or_else(|| format!("unknown split strategy: {s}"))?;
                n.parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(Self::Segments)
                    .ok_or_else(|| format!("invalid segment count: {n}"))
            }
        }
    }
}

/// Which nodes may run a job's tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStrategy {
    /// Prefer nodes with the profile's accelerator, then any node.
    #[default]
    Auto,
    /// Only the named node.
    Specific(NodeId),
    /// Any node, always encoding in software.
    SoftwareOnly,
}

/// Split `duration` into `count` equal ranges. The last range is open-ended
/// so rounding never drops the tail of the source.
pub fn segment_ranges(duration: Duration, count: u32) -> Vec<SegmentRange> {
    let count = count.max(1);
    let step = duration.as_secs_f64() / f64::from(count);
    (0..count)
        .map(|index| SegmentRange {
            index,
            count,
            start: Duration::from_secs_f64(step * f64::from(index)),
            duration: (index + 1 < count).then(|| Duration::from_secs_f64(step)),
        })
        .collect()
}
