//! The seam between task execution and the dispatcher.
//!
//! Executors never touch job or task state directly; they report through
//! this trait and the dispatcher decides what each report means.

use ef_core::{FailureKind, JobId, Result, TaskId};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::JobDispatcher;
use crate::model::{EncodingJob, ManifestInputs, TaskOutput, TaskProgress};

/// Sink for task lifecycle reports. Every method returns whether the report
/// was applied; a `false` means the task moved on without the reporter
/// (cancelled, released, or already finished).
pub trait TaskReporter: Send + Sync {
    fn job_snapshot(&self, job_id: JobId) -> Option<EncodingJob>;

    fn report_started(&self, task_id: TaskId) -> bool;

    fn report_progress(&self, task_id: TaskId, progress: TaskProgress) -> bool;

    fn report_completed(&self, task_id: TaskId, output: TaskOutput) -> bool;

    fn report_failed(&self, task_id: TaskId, kind: FailureKind, error: &str) -> bool;

    fn report_warning(&self, job_id: JobId, message: &str) -> bool;

    /// Completed outputs a master task builds from.
    fn manifest_inputs(&self, job_id: JobId) -> Result<ManifestInputs>;

    fn cancellation_token(&self, task_id: TaskId) -> Option<CancellationToken>;
}

impl TaskReporter for JobDispatcher {
    fn job_snapshot(&self, job_id: JobId) -> Option<EncodingJob> {
        self.get_job(job_id)
    }

    fn report_started(&self, task_id: TaskId) -> bool {
        self.start_task(task_id)
    }

    fn report_progress(&self, task_id: TaskId, progress: TaskProgress) -> bool {
        self.record_progress(task_id, progress)
    }

    fn report_completed(&self, task_id: TaskId, output: TaskOutput) -> bool {
        self.complete_task_with_output(task_id, output)
    }

    fn report_failed(&self, task_id: TaskId, kind: FailureKind, error: &str) -> bool {
        self.fail_task_with_kind(task_id, kind, error)
    }

    fn report_warning(&self, job_id: JobId, message: &str) -> bool {
        self.add_job_warning(job_id, message)
    }

    fn manifest_inputs(&self, job_id: JobId) -> Result<ManifestInputs> {
        JobDispatcher::manifest_inputs(self, job_id)
    }

    fn cancellation_token(&self, task_id: TaskId) -> Option<CancellationToken> {
        self.task_cancellation_token(task_id)
    }
}
