//! Throttled forwarding of ffmpeg progress to the dispatcher.

use std::time::Duration;

use chrono::Utc;
use ef_av::ProgressSnapshot;
use ef_core::TaskId;
use ef_dispatch::{TaskProgress, TaskReporter};
use tokio::time::Instant;

/// Forwards snapshots of one task's runs, at most once per throttle
/// interval. A final snapshot is always forwarded.
///
/// Multi-stage tasks (two-pass encodes, concat then package) map each
/// stage onto an equal share of the task's 0–100 range.
pub struct ProgressForwarder<'a> {
    reporter: &'a dyn TaskReporter,
    task_id: TaskId,
    throttle: Duration,
    last_sent: Option<Instant>,
    stage: u32,
    stages: u32,
}

impl<'a> ProgressForwarder<'a> {
    pub fn new(reporter: &'a dyn TaskReporter, task_id: TaskId, throttle: Duration) -> Self {
        Self {
            reporter,
            task_id,
            throttle,
            last_sent: None,
            stage: 0,
            stages: 1,
        }
    }

    /// Start stage `index` of `count` (zero-based).
    pub fn set_stage(&mut self, index: u32, count: u32) {
        self.stages = count.max(1);
        self.stage = index.min(self.stages - 1);
    }

    /// Forward `snapshot` unless throttled. Returns whether it was sent.
    pub fn forward(&mut self, snapshot: &ProgressSnapshot) -> bool {
        let now = Instant::now();
        let due = self
            .last_sent
            .map_or(true, |last| now.duration_since(last) >= self.throttle);
        if !due && !snapshot.finished {
            return false;
        }
        self.last_sent = Some(now);
        let progress = to_task_progress(snapshot, self.stage, self.stages);
        self.reporter.report_progress(self.task_id, progress)
    }
}

/// Convert a parser snapshot into the dispatcher's progress record.
pub fn to_task_progress(snapshot: &ProgressSnapshot, stage: u32, stages: u32) -> TaskProgress {
    let stages = stages.max(1);
    let share = 100.0 / f64::from(stages);
    let percentage = f64::from(stage) * share + snapshot.percentage.clamp(0.0, 100.0) / 100.0 * share;
    TaskProgress {
        percentage: percentage as f32,
        fps: snapshot.fps.map(|v| v as f32),
        speed: snapshot.speed.map(|v| v as f32),
        bitrate_kbps: snapshot.bitrate_kbps.map(|v| v as f32),
        current_time: snapshot.current_time,
        total_duration: snapshot.total_duration,
        estimated_remaining: snapshot.eta,
        encoded_frames: snapshot.encoded_frames,
        total_frames: snapshot.total_frames,
        output_size: snapshot.output_size,
        updated_at: Some(Utc::now()),
    }
}
