//! Submission requests and operation results.

use std::path::PathBuf;

use ef_codec::EncodingProfile;
use ef_core::ProfileId;
use serde::{Deserialize, Serialize};

use crate::model::EncodingJob;
use crate::strategy::{NodeStrategy, SplitStrategy};

/// How a submission names its profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileRef {
    Id(ProfileId),
    /// Name or id string, resolved through the profile store.
    Name(String),
    /// A profile supplied with the request.
    Inline(Box<EncodingProfile>),
}

impl From<EncodingProfile> for ProfileRef {
    fn from(profile: EncodingProfile) -> Self {
        Self::Inline(Box::new(profile))
    }
}

impl From<ProfileId> for ProfileRef {
    fn from(id: ProfileId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for ProfileRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// A job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub input_path: PathBuf,
    /// Output folder; created by the executor.
    pub output_path: PathBuf,
    pub profile: ProfileRef,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub split_strategy: SplitStrategy,
    #[serde(default)]
    pub node_strategy: NodeStrategy,
    /// Assign root tasks to registered nodes during dispatch.
    #[serde(default)]
    pub assign_nodes_immediately: bool,
    #[serde(default = "default_true")]
    pub include_post_processing: bool,
    #[serde(default = "default_true")]
    pub include_validation: bool,
    #[serde(default)]
    pub title: Option<String>,
    /// Overrides the dispatcher's retry ceiling for this job.
    #[serde(default)]
    pub max_task_retries: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl JobRequest {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        profile: impl Into<ProfileRef>,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            profile: profile.into(),
            priority: 0,
            split_strategy: SplitStrategy::default(),
            node_strategy: NodeStrategy::default(),
            assign_nodes_immediately: false,
            include_post_processing: true,
            include_validation: true,
            title: None,
            max_task_retries: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn split(mut self, strategy: SplitStrategy) -> Self {
        self.split_strategy = strategy;
        self
    }

    pub fn nodes(mut self, strategy: NodeStrategy) -> Self {
        self.node_strategy = strategy;
        self
    }

    pub fn max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = Some(retries);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn assign_immediately(mut self) -> Self {
        self.assign_nodes_immediately = true;
        self
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobDispatchResult {
    pub success: bool,
    /// The job, when one was created (also on analysis failure).
    pub job: Option<EncodingJob>,
    pub errors: Vec<String>,
}

impl JobDispatchResult {
    pub(crate) fn rejected(errors: Vec<String>) -> Self {
        Self {
            success: false,
            job: None,
            errors,
        }
    }

    pub(crate) fn failed(job: EncodingJob, error: String) -> Self {
        Self {
            success: false,
            job: Some(job),
            errors: vec![error],
        }
    }

    pub(crate) fn accepted(job: EncodingJob) -> Self {
        Self {
            success: true,
            job: Some(job),
            errors: Vec::new(),
        }
    }

    /// First error, for single-line display.
    pub fn error_message(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

/// Outcome of a manual retry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskRetryResult {
    pub success: bool,
    pub retried_count: usize,
    pub error: Option<String>,
}

/// Outcome of a job cancellation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobCancelResult {
    pub success: bool,
    pub cancelled_tasks: usize,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_from_json() {
        let req: JobRequest = serde_json::from_str(
            r#"{"input_path": "/in/a.mkv", "output_path": "/out/a", "profile": {"name": "hls-h264-aac"}}"#,
        )
        .unwrap();
        assert_eq!(req.profile, ProfileRef::Name("hls-h264-aac".into()));
        assert!(req.include_post_processing);
        assert!(req.include_validation);
        assert_eq!(req.split_strategy, SplitStrategy::Optimal);
        assert_eq!(req.max_task_retries, None);
    }

    #[test]
    fn builder() {
        let req = JobRequest::new("/in/a.mkv", "/out", "mp4-h264")
            .priority(5)
            .split(SplitStrategy::None)
            .max_task_retries(1);
        assert_eq!(req.priority, 5);
        assert_eq!(req.split_strategy, SplitStrategy::None);
        assert_eq!(req.max_task_retries, Some(1));
    }
}
