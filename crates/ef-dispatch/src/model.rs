//! Job and task records.
//!
//! These are the values the dispatcher owns. Callers only ever see clones;
//! every mutation goes through [`JobDispatcher`](crate::JobDispatcher).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ef_codec::EncodingProfile;
use ef_core::{FailureKind, HwAccel, JobId, NodeId, SubtitleCodec, TaskId};
use ef_manifest::{AudioVariant, QualityPlaylist, SubtitleVariant};
use ef_probe::MediaInfo;
use serde::{Deserialize, Serialize};

use crate::strategy::{NodeStrategy, SplitStrategy};

/// State transitions kept per job.
const MAX_STATE_HISTORY: usize = 32;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    /// Source is being probed.
    Analyzing,
    /// Leaf tasks are queued or running.
    Encoding,
    /// Reversible sub-state of `Encoding`; no new tasks are picked up.
    Paused,
    /// The master task is assembling the final output.
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether tasks of a job in this state may be picked up.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Encoding | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Encoding => "encoding",
            Self::Paused => "paused",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

/// Mutable status of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Mean of the task percentages, 0–100.
    pub progress: f32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Most recent error, verbatim.
    pub error: Option<String>,
    /// State the job was in when `error` was recorded.
    pub error_state: Option<JobState>,
    /// Non-fatal problems (post-processing failures, skipped outputs).
    pub warnings: Vec<String>,
    /// Oldest transitions are dropped once the history is full.
    pub history: Vec<StateTransition>,
}

impl JobStatus {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: JobState::Pending,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            updated_at: now,
            error: None,
            error_state: None,
            warnings: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// Per-job options taken from the submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub split: SplitStrategy,
    pub nodes: NodeStrategy,
    /// Run rule-driven post-processing actions after each transcode.
    pub post_processing: bool,
    /// Check output artifacts after each transcode.
    pub validation: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            split: SplitStrategy::Optimal,
            nodes: NodeStrategy::Auto,
            post_processing: true,
            validation: true,
        }
    }
}

/// One user-visible unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingJob {
    pub id: JobId,
    pub title: Option<String>,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Snapshot taken at submission; later store edits do not apply.
    pub profile: EncodingProfile,
    /// Source description, once analysis has finished.
    pub media: Option<MediaInfo>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub max_task_retries: u32,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Tasks in creation order; the master task is last.
    pub task_ids: Vec<TaskId>,
}

impl EncodingJob {
    pub(crate) fn new(
        input_path: PathBuf,
        output_path: PathBuf,
        profile: EncodingProfile,
        priority: i32,
        max_task_retries: u32,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            title: None,
            input_path,
            output_path,
            profile,
            media: None,
            priority,
            created_at: now,
            max_task_retries,
            options,
            status: JobStatus::new(now),
            task_ids: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    /// Display label: the title, or the input file name.
    pub fn label(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.input_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.input_path.display().to_string())
        })
    }

    /// Move to `to`, recording the transition. Returns the previous state.
    pub(crate) fn transition(&mut self, to: JobState) -> JobState {
        let now = Utc::now();
        let from = self.status.state;
        self.status.state = to;
        self.status.updated_at = now;
        if to == JobState::Analyzing && self.status.started_at.is_none() {
            self.status.started_at = Some(now);
        }
        if to.is_terminal() {
            self.status.completed_at = Some(now);
        } else {
            self.status.completed_at = None;
        }
        if self.status.history.len() >= MAX_STATE_HISTORY {
            self.status.history.remove(0);
        }
        self.status.history.push(StateTransition { from, to, at: now });
        from
    }

    /// Record `error` against the current state and move to `Failed`.
    pub(crate) fn fail(&mut self, error: impl Into<String>) -> JobState {
        self.status.error = Some(error.into());
        self.status.error_state = Some(self.status.state);
        self.transition(JobState::Failed)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Claimed by a node and not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Video,
    Audio,
    Subtitle,
    /// Final assembly; depends on every other task of the job.
    Master,
}

impl JobType {
    pub const ALL: [JobType; 4] = [Self::Video, Self::Audio, Self::Subtitle, Self::Master];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
            Self::Master => "master",
        };
        f.write_str(s)
    }
}

/// Time range of a split video encode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentRange {
    /// Zero-based position of this part.
    pub index: u32,
    pub count: u32,
    pub start: Duration,
    /// `None` for the last part, which runs to the end of the source.
    pub duration: Option<Duration>,
}

/// Which output a task produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Video {
        /// Index into the profile's video outputs.
        output: usize,
        /// Part of a split encode; the master task joins the parts.
        segment: Option<SegmentRange>,
    },
    Audio {
        /// Index into the profile's audio outputs.
        output: usize,
        /// Absolute stream index of the source track.
        stream_index: u32,
        language: Option<String>,
        channels: u32,
        title: Option<String>,
        default: bool,
    },
    Subtitle {
        /// Index into the profile's subtitle outputs.
        output: usize,
        stream_index: u32,
        source_codec: Option<SubtitleCodec>,
        language: Option<String>,
        forced: bool,
        default: bool,
    },
    Master,
}

impl TaskSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Video { .. } => JobType::Video,
            Self::Audio { .. } => JobType::Audio,
            Self::Subtitle { .. } => JobType::Subtitle,
            Self::Master => JobType::Master,
        }
    }

    /// Language of the selected source track, if any.
    pub fn language(&self) -> Option<&str> {
        match self {
            Self::Audio { language, .. } | Self::Subtitle { language, .. } => language.as_deref(),
            _ => None,
        }
    }
}

/// Latest progress reading of a running task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// 0–100.
    pub percentage: f32,
    pub fps: Option<f32>,
    pub speed: Option<f32>,
    pub bitrate_kbps: Option<f32>,
    pub current_time: Option<Duration>,
    pub total_duration: Option<Duration>,
    pub estimated_remaining: Option<Duration>,
    pub encoded_frames: Option<u64>,
    pub total_frames: Option<u64>,
    pub output_size: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskProgress {
    /// Fold a newer reading into this one. Missing fields keep their last
    /// value and the percentage never goes backwards.
    pub fn merge(&mut self, newer: TaskProgress) {
        self.percentage = self.percentage.max(newer.percentage.clamp(0.0, 100.0));
        macro_rules! keep {
            ($($field:ident),*) => {
                $( if newer.$field.is_some() { self.$field = newer.$field; } )*
            };
        }
        keep!(
            fps,
            speed,
            bitrate_kbps,
            current_time,
            total_duration,
            estimated_remaining,
            encoded_frames,
            total_frames,
            output_size
        );
        self.updated_at = Some(newer.updated_at.unwrap_or_else(Utc::now));
    }
}

/// Descriptor of what a completed task produced, for the master task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariantOutput {
    Video(QualityPlaylist),
    Audio(AudioVariant),
    Subtitle(SubtitleVariant),
    /// Intermediate part of a split video encode.
    Part { output: usize, index: u32 },
}

/// Result reported with a task completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Primary artifact (media playlist for segmented containers).
    pub path: PathBuf,
    /// Total bytes written.
    pub size: u64,
    pub variant: Option<VariantOutput>,
}

impl TaskOutput {
    /// Output with the size read from disk (0 when it cannot be read).
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            path,
            size,
            variant: None,
        }
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingTask {
    pub id: TaskId,
    pub job_id: JobId,
    /// Human-readable label such as "1080p video" or "eng audio (aac)".
    pub name: String,
    pub job_type: JobType,
    pub spec: TaskSpec,
    /// Copied from the job.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Creation order within the dispatcher; final pickup tie-break.
    pub seq: u64,
    /// Tasks that must be `Completed` before this one may leave `Pending`.
    pub dependencies: Vec<TaskId>,
    pub node_id: Option<NodeId>,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub progress: TaskProgress,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Hardware the task would like its node to have.
    pub preferred_hw: Option<HwAccel>,
    /// Only this node may run the task.
    pub pinned_node: Option<NodeId>,
    /// When the task last became `Pending`.
    pub pending_since: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EncodingTask {
    /// Back to `Pending` on no node, keeping the retry count.
    pub(crate) fn requeue(&mut self) {
        self.state = TaskState::Pending;
        self.node_id = None;
        self.progress = TaskProgress::default();
        self.pending_since = Utc::now();
        self.assigned_at = None;
        self.started_at = None;
    }

    pub fn is_master(&self) -> bool {
        self.job_type == JobType::Master
    }
}

// ---------------------------------------------------------------------------
// Master task inputs
// ---------------------------------------------------------------------------

/// Output of one completed task, as handed to the master task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedOutput {
    pub task_id: TaskId,
    pub name: String,
    pub spec: TaskSpec,
    pub output: TaskOutput,
}

/// Everything the master task assembles, in task creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManifestInputs {
    pub outputs: Vec<CompletedOutput>,
}

impl ManifestInputs {
    pub fn video_variants(&self) -> Vec<QualityPlaylist> {
        self.variants(|v| match v {
            VariantOutput::Video(q) => Some(q.clone()),
            _ => None,
        })
    }

    pub fn audio_variants(&self) -> Vec<AudioVariant> {
        self.variants(|v| match v {
            VariantOutput::Audio(a) => Some(a.clone()),
            _ => None,
        })
    }

    pub fn subtitle_variants(&self) -> Vec<SubtitleVariant> {
        self.variants(|v| match v {
            VariantOutput::Subtitle(s) => Some(s.clone()),
            _ => None,
        })
    }

    /// Split-encode parts per video output, ordered by part index.
    pub fn split_parts(&self) -> BTreeMap<usize, Vec<PathBuf>> {
        let mut parts: BTreeMap<usize, Vec<(u32, PathBuf)>> = BTreeMap::new();
        for done in &self.outputs {
            if let Some(VariantOutput::Part { output, index }) = &done.output.variant {
                parts
                    .entry(*output)
                    .or_default()
                    .push((*index, done.output.path.clone()));
            }
        }
        parts
            .into_iter()
            .map(|(output, mut list)| {
                list.sort_by_key(|(index, _)| *index);
                (output, list.into_iter().map(|(_, p)| p).collect())
            })
            .collect()
    }

    /// Completed outputs of one task type.
    pub fn of_type(&self, job_type: JobType) -> impl Iterator<Item = &CompletedOutput> {
        self.outputs
            .iter()
            .filter(move |o| o.spec.job_type() == job_type)
    }

    fn variants<T>(&self, pick: impl Fn(&VariantOutput) -> Option<T>) -> Vec<T> {
        self.outputs
            .iter()
            .filter_map(|o| o.output.variant.as_ref())
            .filter_map(pick)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_codec::store::builtin_profiles;

    fn job() -> EncodingJob {
        EncodingJob::new(
            "/in/movie.mkv".into(),
            "/out/movie".into(),
            builtin_profiles().remove(0),
            0,
            3,
            JobOptions::default(),
        )
    }

    #[test]
    fn transition_records_history_and_timestamps() {
        let mut j = job();
        assert_eq!(j.transition(JobState::Analyzing), JobState::Pending);
        assert!(j.status.started_at.is_some());
        j.transition(JobState::Encoding);
        j.transition(JobState::Completed);
        assert!(j.status.completed_at.is_some());
        let states: Vec<_> = j.status.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![JobState::Analyzing, JobState::Encoding, JobState::Completed]
        );
    }

    #[test]
    fn history_is_bounded() {
        let mut j = job();
        for _ in 0..40 {
            j.transition(JobState::Paused);
            j.transition(JobState::Encoding);
        }
        assert_eq!(j.status.history.len(), MAX_STATE_HISTORY);
        assert_eq!(j.status.history.last().map(|t| t.to), Some(JobState::Encoding));
    }

    #[test]
    fn fail_records_error_state() {
        let mut j = job();
        j.transition(JobState::Analyzing);
        j.transition(JobState::Encoding);
        j.fail("exit status 1");
        assert_eq!(j.state(), JobState::Failed);
        assert_eq!(j.status.error.as_deref(), Some("exit status 1"));
        assert_eq!(j.status.error_state, Some(JobState::Encoding));
    }

    #[test]
    fn label_falls_back_to_file_name() {
        let mut j = job();
        assert_eq!(j.label(), "movie.mkv");
        j.title = Some("Feature".into());
        assert_eq!(j.label(), "Feature");
    }

    #[test]
    fn progress_merge_keeps_fields_and_never_decreases() {
        let mut p = TaskProgress {
            percentage: 40.0,
            fps: Some(48.0),
            ..Default::default()
        };
        p.merge(TaskProgress {
            percentage: 35.0,
            bitrate_kbps: Some(4800.0),
            ..Default::default()
        });
        assert_eq!(p.percentage, 40.0);
        assert_eq!(p.fps, Some(48.0));
        assert_eq!(p.bitrate_kbps, Some(4800.0));

        p.merge(TaskProgress {
            percentage: 250.0,
            ..Default::default()
        });
        assert_eq!(p.percentage, 100.0);
    }

    #[test]
    fn split_parts_are_ordered() {
        let part = |output: usize, index: u32, path: &str| CompletedOutput {
            task_id: TaskId::new(),
            name: format!("part {index}"),
            spec: TaskSpec::Video {
                output,
                segment: None,
            },
            output: TaskOutput {
                path: path.into(),
                size: 1,
                variant: Some(VariantOutput::Part { output, index }),
            },
        };
        let inputs = ManifestInputs {
            outputs: vec![
                part(0, 1, "/w/0-1.mkv"),
                part(1, 0, "/w/1-0.mkv"),
                part(0, 0, "/w/0-0.mkv"),
            ],
        };
        let parts = inputs.split_parts();
        assert_eq!(
            parts[&0],
            vec![PathBuf::from("/w/0-0.mkv"), PathBuf::from("/w/0-1.mkv")]
        );
        assert_eq!(parts[&1].len(), 1);
        assert!(inputs.video_variants().is_empty());
        assert_eq!(inputs.of_type(JobType::Video).count(), 3);
    }

    #[test]
    fn states_terminality() {
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(!JobState::Paused.accepts_work());
        assert!(JobState::Processing.accepts_work());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Running.is_active());
        assert_eq!(JobType::Master.to_string(), "master");
    }
}
