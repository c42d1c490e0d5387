//! The job dispatcher: single owner of all job and task state.
//!
//! Jobs and tasks live in two `DashMap`s, each record behind its own
//! `parking_lot::Mutex`. Every state change is a compare-and-set under the
//! record's lock, so nodes polling concurrently only contend on the task
//! they are trying to claim.
//!
//! Lock order: a job lock may be held while taking task locks, never the
//! other way round. Events are broadcast after all locks are released.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ef_codec::{CodecRegistry, EncodingProfile, ProfileStore};
use ef_core::config::DispatcherConfig;
use ef_core::events::{Event, EventBus, EventCategory, EventPayload};
use ef_core::{Error, FailureKind, HwAccel, JobId, NodeId, Result, TaskId};
use ef_probe::MediaAnalyzer;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::decompose::plan_tasks;
use crate::model::{
    CompletedOutput, EncodingJob, EncodingTask, JobOptions, JobState, ManifestInputs, TaskOutput,
    TaskProgress, TaskSpec, TaskState,
};
use crate::nodes::{NodeInfo, NodeRegistry, TaskFilter};
use crate::request::{JobCancelResult, JobDispatchResult, JobRequest, ProfileRef, TaskRetryResult};
use crate::strategy::NodeStrategy;

/// Upper bound on get-next/assign rounds in one claim.
const MAX_CLAIM_ATTEMPTS: usize = 16;

struct JobRecord {
    job: Mutex<EncodingJob>,
    /// Parent of every task attempt token of this job.
    cancel: CancellationToken,
}

struct TaskRecord {
    task: Mutex<EncodingTask>,
    /// Token of the current attempt, set by `start_task`.
    attempt: Mutex<Option<CancellationToken>>,
}

impl TaskRecord {
    fn cancel_attempt(&self) {
        if let Some(token) = self.attempt.lock().take() {
            token.cancel();
        }
    }

    fn clear_attempt(&self) {
        self.attempt.lock().take();
    }
}

/// Outcome of a failure report.
enum FailOutcome {
    Requeued,
    Exhausted,
}

/// Accepts submissions, decomposes them into tasks and owns every
/// job/task state transition.
pub struct JobDispatcher {
    config: DispatcherConfig,
    profiles: Arc<ProfileStore>,
    analyzer: Arc<dyn MediaAnalyzer>,
    codecs: CodecRegistry,
    nodes: NodeRegistry,
    events: Arc<EventBus>,
    jobs: DashMap<JobId, Arc<JobRecord>>,
    tasks: DashMap<TaskId, Arc<TaskRecord>>,
    next_seq: AtomicU64,
}

impl JobDispatcher {
    pub fn new(
        config: DispatcherConfig,
        profiles: Arc<ProfileStore>,
        analyzer: Arc<dyn MediaAnalyzer>,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        Self {
            config,
            profiles,
            analyzer,
            codecs: CodecRegistry::builtin(),
            nodes: NodeRegistry::new(),
            events,
            jobs: DashMap::new(),
            tasks: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Restrict profile checks to the encoders an installation offers.
    pub fn with_codec_registry(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // -- Nodes ---------------------------------------------------------------

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Register a node and its hardware encoders.
    pub fn register_node(&self, node_id: NodeId, accels: Vec<HwAccel>) -> bool {
        let added = self.nodes.register(node_id.clone(), accels);
        if added {
            tracing::info!(node_id = %node_id, "Node registered");
            self.emit(EventCategory::Node, EventPayload::NodeRegistered { node_id });
        }
        added
    }

    // -- Submission ----------------------------------------------------------

    /// Validate a submission, analyze its source and create its tasks.
    ///
    /// Invalid requests are rejected without creating anything. A job whose
    /// analysis or decomposition fails is kept in `Failed` so the error stays
    /// visible.
    pub async fn dispatch(&self, request: JobRequest) -> JobDispatchResult {
        let profile = match self.validate_request(&request) {
            Ok(profile) => profile,
            Err(errors) => {
                tracing::warn!(
                    input = %request.input_path.display(),
                    "Rejected job submission: {}",
                    errors.join("; ")
                );
                return JobDispatchResult::rejected(errors);
            }
        };

        let options = JobOptions {
            split: request.split_strategy,
            nodes: request.node_strategy.clone(),
            post_processing: request.include_post_processing,
            validation: request.include_validation,
        };
        let max_retries = request
            .max_task_retries
            .unwrap_or(self.config.max_task_retries);
        let mut job = EncodingJob::new(
            request.input_path.clone(),
            request.output_path.clone(),
            profile,
            request.priority,
            max_retries,
            options,
        );
        job.title = request.title.clone();
        let job_id = job.id;

        let record = Arc::new(JobRecord {
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
        });
        self.jobs.insert(job_id, Arc::clone(&record));
        self.transition_job(&record, &[JobState::Pending], JobState::Analyzing);
        tracing::info!(job_id = %job_id, input = %request.input_path.display(), "Analyzing source");

        let media = match self.analyzer.analyze(&request.input_path).await {
            Ok(media) => media,
            Err(e) => {
                let message = format!("analysis failed: {e}");
                let job = self.fail_job(&record, &message);
                return JobDispatchResult::failed(job, message);
            }
        };

        let (profile, options) = {
            let job = record.job.lock();
            (job.profile.clone(), job.options.clone())
        };
        let plan = match plan_tasks(&profile, &media, &options, self.nodes.len(), &self.config) {
            Ok(plan) => plan,
            Err(e) => {
                let job = self.fail_job(&record, &e.to_string());
                return JobDispatchResult::failed(job, e.to_string());
            }
        };

        let (priority, created_at) = {
            let job = record.job.lock();
            (job.priority, job.created_at)
        };
        let mut task_records = Vec::with_capacity(plan.tasks.len());
        let mut leaf_ids = Vec::new();
        for planned in plan.tasks {
            let id = TaskId::new();
            let is_master = matches!(planned.spec, TaskSpec::Master);
            let task = EncodingTask {
                id,
                job_id,
                name: planned.name,
                job_type: planned.spec.job_type(),
                spec: planned.spec,
                priority,
                created_at,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                dependencies: if is_master { leaf_ids.clone() } else { Vec::new() },
                node_id: None,
                state: TaskState::Pending,
                retry_count: 0,
                max_retries,
                progress: TaskProgress::default(),
                output: None,
                error: None,
                failure_kind: None,
                preferred_hw: planned.preferred_hw,
                pinned_node: match &options.nodes {
                    NodeStrategy::Specific(node) => Some(node.clone()),
                    _ => None,
                },
                pending_since: Utc::now(),
                assigned_at: None,
                started_at: None,
                completed_at: None,
            };
            if !is_master {
                leaf_ids.push(id);
            }
            let task_record = Arc::new(TaskRecord {
                task: Mutex::new(task),
                attempt: Mutex::new(None),
            });
            self.tasks.insert(id, Arc::clone(&task_record));
            task_records.push((id, task_record));
        }

        let task_count = task_records.len();
        let accepted = {
            let mut job = record.job.lock();
            job.media = Some(media);
            job.task_ids = task_records.iter().map(|(id, _)| *id).collect();
            if job.state() == JobState::Analyzing {
                job.status.warnings.extend(plan.warnings.iter().cloned());
                job.transition(JobState::Encoding);
                true
            } else {
                // Cancelled while analyzing.
                for (_, task) in &task_records {
                    task.task.lock().state = TaskState::Cancelled;
                }
                false
            }
        };
        if !accepted {
            let job = self.snapshot(&record);
            return JobDispatchResult::failed(job, "job was cancelled during analysis".into());
        }

        self.emit_job(EventPayload::JobStateChanged {
            job_id,
            from: JobState::Analyzing.to_string(),
            to: JobState::Encoding.to_string(),
        });
        for message in plan.warnings {
            tracing::warn!(job_id = %job_id, "{message}");
            self.emit_job(EventPayload::JobWarning { job_id, message });
        }
        self.emit_job(EventPayload::JobQueued { job_id, task_count });
        tracing::info!(job_id = %job_id, tasks = task_count, "Job queued");

        if request.assign_nodes_immediately {
            self.assign_root_tasks(job_id);
        }
        JobDispatchResult::accepted(self.snapshot(&record))
    }

    fn validate_request(&self, request: &JobRequest) -> std::result::Result<EncodingProfile, Vec<String>> {
        let mut errors = Vec::new();
        if request.input_path.as_os_str().is_empty() {
            errors.push("input path is empty".to_string());
        }
        if request.output_path.as_os_str().is_empty() {
            errors.push("output path is empty".to_string());
        }

        let profile = match &request.profile {
            ProfileRef::Id(id) => self.profiles.get(*id),
            ProfileRef::Name(name) => self.profiles.resolve(name),
            ProfileRef::Inline(profile) => Ok(profile.as_ref().clone()),
        };
        match profile {
            Ok(profile) => {
                errors.extend(profile.problems());
                errors.extend(self.codecs.check_profile(&profile));
                if errors.is_empty() {
                    return Ok(profile);
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
        Err(errors)
    }

    /// Assign the job's dependency-free tasks to registered nodes, least
    /// loaded first. Hardware-preferring tasks only go to capable nodes.
    fn assign_root_tasks(&self, job_id: JobId) {
        let nodes = self.nodes.list();
        if nodes.is_empty() {
            tracing::debug!(job_id = %job_id, "No registered nodes for immediate assignment");
            return;
        }

        let mut load: HashMap<NodeId, usize> = HashMap::new();
        for record in self.task_records() {
            let task = record.task.lock();
            if let (true, Some(node)) = (task.state.is_active(), &task.node_id) {
                *load.entry(node.clone()).or_default() += 1;
            }
        }

        let roots: Vec<EncodingTask> = self
            .tasks_for_job(job_id)
            .into_iter()
            .filter(|t| t.dependencies.is_empty() && t.state == TaskState::Pending)
            .collect();
        for task in roots {
            let target = match (&task.pinned_node, task.preferred_hw) {
                (Some(pinned), _) => nodes.iter().find(|n| &n.id == pinned).map(|n| n.id.clone()),
                (None, Some(hw)) => least_loaded(nodes.iter().filter(|n| n.has_accel(hw)), &load),
                (None, None) => least_loaded(nodes.iter(), &load),
            };
            if let Some(node) = target {
                if self.assign_task_to_node(task.id, node.clone()) {
                    *load.entry(node).or_default() += 1;
                }
            }
        }
    }

    // -- Queries -------------------------------------------------------------

    pub fn get_job(&self, job_id: JobId) -> Option<EncodingJob> {
        self.job_record(job_id).map(|r| self.snapshot(&r))
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<EncodingJob> {
        let records: Vec<Arc<JobRecord>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut jobs: Vec<EncodingJob> = records.iter().map(|r| self.snapshot(r)).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<EncodingTask> {
        self.task_record(task_id).map(|r| r.task.lock().clone())
    }

    /// Tasks of a job in creation order.
    pub fn tasks_for_job(&self, job_id: JobId) -> Vec<EncodingTask> {
        let Some(record) = self.job_record(job_id) else {
            return Vec::new();
        };
        let ids = record.job.lock().task_ids.clone();
        ids.into_iter().filter_map(|id| self.get_task(id)).collect()
    }

    /// Highest-priority, oldest eligible `Pending` task for `filter`.
    ///
    /// A task is eligible when its job accepts work and is below its
    /// concurrency limit, all its dependencies are `Completed`, and the
    /// asking node may run it. `None` simply means nothing qualifies.
    pub fn get_next_pending_task(&self, filter: &TaskFilter) -> Option<EncodingTask> {
        let now = Utc::now();
        let node = filter.node_id.as_ref().and_then(|id| self.nodes.get(id));

        let mut candidates = Vec::new();
        for record in self.task_records() {
            let task = record.task.lock();
            if task.state != TaskState::Pending || !filter.accepts_type(task.job_type) {
                continue;
            }
            if let (Some(pinned), Some(asking)) = (&task.pinned_node, &filter.node_id) {
                if pinned != asking {
                    continue;
                }
            }
            if let Some(hw) = task.preferred_hw {
                let capable = match (&filter.node_id, &node) {
                    (None, _) => true,
                    (Some(_), Some(info)) => info.has_accel(hw),
                    (Some(_), None) => false,
                };
                if !capable && !self.fallback_elapsed(task.pending_since, now) {
                    continue;
                }
            }
            candidates.push((
                (Reverse(task.priority), task.created_at, task.seq),
                task.id,
                task.job_id,
                task.dependencies.clone(),
            ));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut job_ok: HashMap<JobId, bool> = HashMap::new();
        for (_, task_id, job_id, deps) in candidates {
            let accepts = *job_ok
                .entry(job_id)
                .or_insert_with(|| self.job_has_capacity(job_id));
            if accepts && self.dependencies_met(&deps) {
                return self.get_task(task_id);
            }
        }
        None
    }

    // -- Task transitions ----------------------------------------------------

    /// `Pending` → `Assigned`. Exactly one of any number of concurrent
    /// callers for the same task succeeds; the rest get `false`.
    pub fn assign_task_to_node(&self, task_id: TaskId, node_id: NodeId) -> bool {
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let (job_id, deps) = {
            let task = record.task.lock();
            if task.state != TaskState::Pending {
                return false;
            }
            (task.job_id, task.dependencies.clone())
        };
        if !self.job_accepts_work(job_id) {
            return false;
        }
        if !self.dependencies_met(&deps) {
            tracing::debug!(task_id = %task_id, "Dependencies not satisfied; not assigning");
            return false;
        }

        {
            let mut task = record.task.lock();
            if task.state != TaskState::Pending {
                return false;
            }
            task.state = TaskState::Assigned;
            task.node_id = Some(node_id.clone());
            task.assigned_at = Some(Utc::now());
        }
        self.nodes.heartbeat(&node_id);
        tracing::debug!(job_id = %job_id, task_id = %task_id, node_id = %node_id, "Task assigned");
        self.emit_task(EventPayload::TaskAssigned {
            job_id,
            task_id,
            node_id,
        });
        true
    }

    /// Get the next eligible task and assign it to the filter's node.
    pub fn claim_next_task(&self, filter: &TaskFilter) -> Option<EncodingTask> {
        let Some(node_id) = filter.node_id.clone() else {
            tracing::warn!("claim_next_task called without a node id");
            return None;
        };
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let task = self.get_next_pending_task(filter)?;
            if self.assign_task_to_node(task.id, node_id.clone()) {
                return self.get_task(task.id);
            }
        }
        None
    }

    /// `Assigned` → `Running`. Starting the master task moves the job to
    /// `Processing`.
    pub fn start_task(&self, task_id: TaskId) -> bool {
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let job_id = record.task.lock().job_id;
        let Some(job) = self.job_record(job_id) else {
            return false;
        };
        let is_master = {
            let mut task = record.task.lock();
            if task.state != TaskState::Assigned {
                return false;
            }
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
            // Installed under the task lock: a release or cancel racing this
            // start sees the new attempt and cancels it.
            *record.attempt.lock() = Some(job.cancel.child_token());
            task.is_master()
        };

        if is_master {
            self.transition_job(&job, &[JobState::Encoding], JobState::Processing);
        }
        tracing::debug!(job_id = %job_id, task_id = %task_id, "Task started");
        self.emit_task(EventPayload::TaskStarted { job_id, task_id });
        true
    }

    /// Complete a running task, recording its output path and on-disk size.
    pub fn complete_task(&self, task_id: TaskId, output_file: Option<PathBuf>) -> bool {
        let output = match output_file {
            Some(path) => TaskOutput::from_path(path),
            None => TaskOutput {
                path: PathBuf::new(),
                size: 0,
                variant: None,
            },
        };
        self.complete_task_with_output(task_id, output)
    }

    /// `Running` → `Completed`.
    ///
    /// A completion for a task that is not running (cancelled, released,
    /// already finished) is ignored and returns `false`.
    pub fn complete_task_with_output(&self, task_id: TaskId, output: TaskOutput) -> bool {
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let (job_id, is_master) = {
            let mut task = record.task.lock();
            if task.state != TaskState::Running {
                tracing::debug!(task_id = %task_id, state = %task.state, "Ignoring completion for task that is not running");
                return false;
            }
            task.state = TaskState::Completed;
            task.completed_at = Some(Utc::now());
            task.progress.percentage = 100.0;
            task.output = Some(output);
            (task.job_id, task.is_master())
        };
        record.clear_attempt();
        tracing::info!(job_id = %job_id, task_id = %task_id, "Task completed");
        self.emit_task(EventPayload::TaskCompleted { job_id, task_id });

        let Some(job_record) = self.job_record(job_id) else {
            return true;
        };
        let mut events = Vec::new();
        {
            let mut job = job_record.job.lock();
            job.status.progress = self.mean_progress(&job);
            if !job.state().is_terminal() {
                if is_master {
                    let from = job.transition(JobState::Completed);
                    job.status.progress = 100.0;
                    events.push(state_changed(job_id, from, JobState::Completed));
                    events.push(EventPayload::JobCompleted { job_id });
                } else if let Some(master) = self.unblocked_master(&job) {
                    events.push(EventPayload::TaskUnblocked {
                        job_id,
                        task_id: master,
                    });
                }
            }
            events.push(EventPayload::JobProgress {
                job_id,
                progress: job.status.progress,
            });
        }
        if is_master {
            tracing::info!(job_id = %job_id, "Job completed");
        }
        for payload in events {
            self.emit_job(payload);
        }
        true
    }

    /// Report a process failure. See [`fail_task_with_kind`](Self::fail_task_with_kind).
    pub fn fail_task(&self, task_id: TaskId, error: &str) -> bool {
        self.fail_task_with_kind(task_id, FailureKind::Process, error)
    }

    /// `Assigned`/`Running` → `Failed`.
    ///
    /// While the task has retries left it goes straight back to `Pending`
    /// with its retry count incremented; this is the only automatic requeue.
    /// Once the ceiling is reached, or for a job-fatal kind such as a
    /// manifest failure, the task stays `Failed` and the job fails with
    /// `error`. A `Cancelled` kind cancels the task without a retry.
    pub fn fail_task_with_kind(&self, task_id: TaskId, kind: FailureKind, error: &str) -> bool {
        if kind == FailureKind::Cancelled {
            return self.cancel_task(task_id);
        }
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let (job_id, outcome, retry_count, name) = {
            let mut task = record.task.lock();
            if !task.state.is_active() {
                tracing::debug!(task_id = %task_id, state = %task.state, "Ignoring failure for task that is not running");
                return false;
            }
            task.error = Some(error.to_string());
            task.failure_kind = Some(kind);
            let outcome = if task.retry_count < task.max_retries && !kind.is_job_fatal() {
                task.retry_count += 1;
                task.requeue();
                FailOutcome::Requeued
            } else {
                task.state = TaskState::Failed;
                task.completed_at = Some(Utc::now());
                FailOutcome::Exhausted
            };
            (task.job_id, outcome, task.retry_count, task.name.clone())
        };
        record.cancel_attempt();

        let will_retry = matches!(outcome, FailOutcome::Requeued);
        if will_retry {
            tracing::warn!(job_id = %job_id, task_id = %task_id, retry = retry_count, "Task '{name}' failed ({kind}), retrying: {error}");
        } else {
            tracing::error!(job_id = %job_id, task_id = %task_id, retries = retry_count, "Task '{name}' failed ({kind}): {error}");
        }
        self.emit_task(EventPayload::TaskFailed {
            job_id,
            task_id,
            kind,
            error: error.to_string(),
            will_retry,
        });

        if !will_retry {
            if let Some(job) = self.job_record(job_id) {
                self.fail_job(&job, error);
            }
        }
        true
    }

    /// Cancel one task. The job cannot finish without it, so a job that is
    /// still running fails; `retry_failed_tasks` can bring the task back.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let (job_id, name) = {
            let mut task = record.task.lock();
            if task.state.is_terminal() {
                return false;
            }
            task.state = TaskState::Cancelled;
            task.failure_kind = Some(FailureKind::Cancelled);
            task.completed_at = Some(Utc::now());
            (task.job_id, task.name.clone())
        };
        record.cancel_attempt();
        tracing::info!(job_id = %job_id, task_id = %task_id, "Task '{name}' cancelled");
        self.emit_task(EventPayload::TaskCancelled { job_id, task_id });

        if let Some(job) = self.job_record(job_id) {
            let running = !job.job.lock().state().is_terminal();
            if running {
                self.fail_job(&job, &format!("task '{name}' was cancelled"));
            }
        }
        true
    }

    /// Give a claimed task back to the queue without using a retry slot
    /// (node shutdown). Its running attempt, if any, is cancelled.
    pub fn release_task(&self, task_id: TaskId) -> bool {
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let job_id = {
            let mut task = record.task.lock();
            if !task.state.is_active() {
                return false;
            }
            task.requeue();
            task.job_id
        };
        record.cancel_attempt();
        tracing::info!(job_id = %job_id, task_id = %task_id, "Task released back to the queue");
        self.emit_task(EventPayload::TaskReleased { job_id, task_id });
        true
    }

    /// Merge a progress reading into a running task.
    pub fn record_progress(&self, task_id: TaskId, progress: TaskProgress) -> bool {
        let Some(record) = self.task_record(task_id) else {
            return false;
        };
        let (job_id, payload) = {
            let mut task = record.task.lock();
            if task.state != TaskState::Running {
                return false;
            }
            task.progress.merge(progress);
            let p = &task.progress;
            (
                task.job_id,
                EventPayload::TaskProgress {
                    job_id: task.job_id,
                    task_id,
                    progress: p.percentage,
                    fps: p.fps,
                    eta_secs: p.estimated_remaining.map(|d| d.as_secs_f64()),
                },
            )
        };
        self.emit_task(payload);
        self.refresh_job_progress(job_id);
        true
    }

    // -- Job operations ------------------------------------------------------

    /// Operator override: every `Failed` task of the job goes back to
    /// `Pending` with its retry count unchanged, regardless of the ceiling.
    /// Tasks cancelled individually are included unless the whole job was
    /// cancelled. A failed job resumes `Encoding`.
    pub fn retry_failed_tasks(&self, job_id: JobId) -> TaskRetryResult {
        let Some(record) = self.job_record(job_id) else {
            return TaskRetryResult {
                success: false,
                retried_count: 0,
                error: Some(Error::not_found("job", job_id).to_string()),
            };
        };

        let mut events = Vec::new();
        let retried = {
            let mut job = record.job.lock();
            if job.state() == JobState::Cancelled {
                return TaskRetryResult {
                    success: false,
                    retried_count: 0,
                    error: Some("job is cancelled".to_string()),
                };
            }
            let mut retried = 0;
            for id in job.task_ids.clone() {
                let Some(task_record) = self.task_record(id) else {
                    continue;
                };
                let mut task = task_record.task.lock();
                if matches!(task.state, TaskState::Failed | TaskState::Cancelled) {
                    task.requeue();
                    task.completed_at = None;
                    retried += 1;
                    events.push(EventPayload::TaskReleased { job_id, task_id: id });
                }
            }
            if retried > 0 && job.state() == JobState::Failed {
                let from = job.transition(JobState::Encoding);
                events.push(state_changed(job_id, from, JobState::Encoding));
            }
            retried
        };

        tracing::info!(job_id = %job_id, retried, "Manual retry of failed tasks");
        for payload in events {
            self.emit_job(payload);
        }
        TaskRetryResult {
            success: true,
            retried_count: retried,
            error: None,
        }
    }

    /// Cancel the job and every non-terminal task synchronously. Running
    /// attempts are signalled through their cancellation tokens; this does
    /// not wait for the processes to exit.
    pub fn cancel_job(&self, job_id: JobId) -> JobCancelResult {
        let Some(record) = self.job_record(job_id) else {
            return JobCancelResult {
                success: false,
                cancelled_tasks: 0,
                error: Some(Error::not_found("job", job_id).to_string()),
            };
        };

        let (from, cancelled) = {
            let mut job = record.job.lock();
            if job.state().is_terminal() {
                return JobCancelResult {
                    success: false,
                    cancelled_tasks: 0,
                    error: Some(format!("job is already {}", job.state())),
                };
            }
            let now = Utc::now();
            let mut cancelled = 0;
            for id in &job.task_ids {
                let Some(task_record) = self.task_record(*id) else {
                    continue;
                };
                let mut task = task_record.task.lock();
                if !task.state.is_terminal() {
                    task.state = TaskState::Cancelled;
                    task.failure_kind = Some(FailureKind::Cancelled);
                    task.completed_at = Some(now);
                    cancelled += 1;
                }
                drop(task);
                task_record.cancel_attempt();
            }
            (job.transition(JobState::Cancelled), cancelled)
        };
        record.cancel.cancel();

        tracing::info!(job_id = %job_id, cancelled_tasks = cancelled, "Job cancelled");
        self.emit_job(state_changed(job_id, from, JobState::Cancelled));
        self.emit_job(EventPayload::JobCancelled {
            job_id,
            cancelled_tasks: cancelled,
        });
        JobCancelResult {
            success: true,
            cancelled_tasks: cancelled,
            error: None,
        }
    }

    /// `Encoding` → `Paused`. Running tasks continue; nothing new starts.
    pub fn pause_job(&self, job_id: JobId) -> bool {
        self.job_record(job_id)
            .is_some_and(|r| self.transition_job(&r, &[JobState::Encoding], JobState::Paused))
    }

    /// `Paused` → `Encoding`.
    pub fn resume_job(&self, job_id: JobId) -> bool {
        self.job_record(job_id)
            .is_some_and(|r| self.transition_job(&r, &[JobState::Paused], JobState::Encoding))
    }

    /// Attach a non-fatal warning to a job.
    pub fn add_job_warning(&self, job_id: JobId, message: &str) -> bool {
        let Some(record) = self.job_record(job_id) else {
            return false;
        };
        record.job.lock().status.warnings.push(message.to_string());
        tracing::warn!(job_id = %job_id, "{message}");
        self.emit_job(EventPayload::JobWarning {
            job_id,
            message: message.to_string(),
        });
        true
    }

    /// Token of the task's current attempt; cancelled when the task or its
    /// job is cancelled or the task is released.
    pub fn task_cancellation_token(&self, task_id: TaskId) -> Option<CancellationToken> {
        self.task_record(task_id)
            .and_then(|r| r.attempt.lock().clone())
    }

    /// Outputs of every non-master task of the job.
    ///
    /// Fails with [`Error::Conflict`] while any of them is not `Completed`.
    pub fn manifest_inputs(&self, job_id: JobId) -> Result<ManifestInputs> {
        let record = self
            .job_record(job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;
        let job = record.job.lock();
        let mut inputs = ManifestInputs::default();
        for id in &job.task_ids {
            let Some(task_record) = self.task_record(*id) else {
                continue;
            };
            let task = task_record.task.lock();
            if task.is_master() {
                continue;
            }
            match (&task.state, &task.output) {
                (TaskState::Completed, Some(output)) => inputs.outputs.push(CompletedOutput {
                    task_id: task.id,
                    name: task.name.clone(),
                    spec: task.spec.clone(),
                    output: output.clone(),
                }),
                (TaskState::Completed, None) => {
                    return Err(Error::Conflict(format!(
                        "task '{}' completed without an output",
                        task.name
                    )))
                }
                (state, _) => {
                    return Err(Error::Conflict(format!("task '{}' is {state}", task.name)))
                }
            }
        }
        Ok(inputs)
    }

    // -- Internals -----------------------------------------------------------

    fn job_record(&self, job_id: JobId) -> Option<Arc<JobRecord>> {
        self.jobs.get(&job_id).map(|r| Arc::clone(r.value()))
    }

    fn task_record(&self, task_id: TaskId) -> Option<Arc<TaskRecord>> {
        self.tasks.get(&task_id).map(|r| Arc::clone(r.value()))
    }

    fn task_records(&self) -> Vec<Arc<TaskRecord>> {
        self.tasks.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn snapshot(&self, record: &JobRecord) -> EncodingJob {
        record.job.lock().clone()
    }

    fn fallback_elapsed(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let wait = chrono::Duration::from_std(self.config.node_fallback_wait())
            .unwrap_or_else(|_| chrono::Duration::zero());
        now - since >= wait
    }

    fn job_accepts_work(&self, job_id: JobId) -> bool {
        self.job_record(job_id)
            .is_some_and(|r| r.job.lock().state().accepts_work())
    }

    /// Accepts work and has fewer active tasks than its profile allows.
    fn job_has_capacity(&self, job_id: JobId) -> bool {
        let Some(record) = self.job_record(job_id) else {
            return false;
        };
        let job = record.job.lock();
        if !job.state().accepts_work() {
            return false;
        }
        let Some(limit) = job.profile.options.max_concurrent_jobs else {
            return true;
        };
        let active = job
            .task_ids
            .iter()
            .filter_map(|id| self.task_record(*id))
            .filter(|r| r.task.lock().state.is_active())
            .count();
        active < limit as usize
    }

    fn dependencies_met(&self, deps: &[TaskId]) -> bool {
        deps.iter().all(|id| {
            self.task_record(*id)
                .is_some_and(|r| r.task.lock().state == TaskState::Completed)
        })
    }

    /// The master task, if it is `Pending` and every other task is done.
    /// Called with the job lock held.
    fn unblocked_master(&self, job: &EncodingJob) -> Option<TaskId> {
        let (&master_id, leaves) = job.task_ids.split_last()?;
        if !self.dependencies_met(leaves) {
            return None;
        }
        let master = self.task_record(master_id)?;
        let pending = master.task.lock().state == TaskState::Pending;
        pending.then_some(master_id)
    }

    /// Mean task percentage. Called with the job lock held.
    fn mean_progress(&self, job: &EncodingJob) -> f32 {
        if job.task_ids.is_empty() {
            return 0.0;
        }
        let total: f32 = job
            .task_ids
            .iter()
            .filter_map(|id| self.task_record(*id))
            .map(|r| r.task.lock().progress.percentage)
            .sum();
        total / job.task_ids.len() as f32
    }

    fn refresh_job_progress(&self, job_id: JobId) {
        let Some(record) = self.job_record(job_id) else {
            return;
        };
        let progress = {
            let mut job = record.job.lock();
            let progress = self.mean_progress(&job);
            if (progress - job.status.progress).abs() < f32::EPSILON {
                return;
            }
            job.status.progress = progress;
            job.status.updated_at = Utc::now();
            progress
        };
        self.emit_job(EventPayload::JobProgress { job_id, progress });
    }

    /// Move the job to `to` if it is in one of `from`.
    fn transition_job(&self, record: &JobRecord, from: &[JobState], to: JobState) -> bool {
        let (job_id, previous) = {
            let mut job = record.job.lock();
            if !from.contains(&job.state()) {
                return false;
            }
            (job.id, job.transition(to))
        };
        tracing::debug!(job_id = %job_id, from = %previous, to = %to, "Job state changed");
        self.emit_job(state_changed(job_id, previous, to));
        true
    }

    /// Fail a non-terminal job with `error`, returning its snapshot.
    ///
    /// Every task still pending or in flight is cancelled along with its
    /// running attempt. The job token itself stays live so that
    /// `retry_failed_tasks` can start new attempts.
    fn fail_job(&self, record: &JobRecord, error: &str) -> EncodingJob {
        let (job_id, from, snapshot, stopped) = {
            let mut job = record.job.lock();
            if job.state().is_terminal() {
                return job.clone();
            }
            let now = Utc::now();
            let mut stopped = Vec::new();
            for id in &job.task_ids {
                let Some(task_record) = self.task_record(*id) else {
                    continue;
                };
                let mut task = task_record.task.lock();
                if task.state.is_terminal() {
                    continue;
                }
                task.state = TaskState::Cancelled;
                task.failure_kind = Some(FailureKind::Cancelled);
                task.completed_at = Some(now);
                drop(task);
                task_record.cancel_attempt();
                stopped.push(*id);
            }
            let from = job.fail(error);
            (job.id, from, job.clone(), stopped)
        };
        tracing::error!(job_id = %job_id, failed_in = %from, stopped_tasks = stopped.len(), "Job failed: {error}");
        for task_id in stopped {
            self.emit_task(EventPayload::TaskCancelled { job_id, task_id });
        }
        self.emit_job(state_changed(job_id, from, JobState::Failed));
        self.emit_job(EventPayload::JobFailed {
            job_id,
            error: error.to_string(),
        });
        snapshot
    }

    fn emit(&self, category: EventCategory, payload: EventPayload) {
        self.events.broadcast(category, payload);
    }

    fn emit_job(&self, payload: EventPayload) {
        self.emit(EventCategory::Job, payload);
    }

    fn emit_task(&self, payload: EventPayload) {
        self.emit(EventCategory::Task, payload);
    }
}

fn least_loaded<'a>(
    candidates: impl Iterator<Item = &'a NodeInfo>,
    load: &HashMap<NodeId, usize>,
) -> Option<NodeId> {
    candidates
        .min_by_key(|n| (load.get(&n.id).copied().unwrap_or(0), n.id.clone()))
        .map(|n| n.id.clone())
}

fn state_changed(job_id: JobId, from: JobState, to: JobState) -> EventPayload {
    EventPayload::JobStateChanged {
        job_id,
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SplitStrategy;
    use assert_matches::assert_matches;
    use ef_codec::store::HLS_H264_AAC;
    use ef_probe::fixtures::{self, StaticAnalyzer};
    use std::time::Duration;

    fn dispatcher(config: DispatcherConfig) -> JobDispatcher {
        let media = fixtures::sdr_1080p(Duration::from_secs(120));
        JobDispatcher::new(
            config,
            Arc::new(ProfileStore::in_memory()),
            Arc::new(StaticAnalyzer::new(media)),
        )
    }

    fn request() -> JobRequest {
        JobRequest::new("/media/source.mkv", "/out/source", HLS_H264_AAC).split(SplitStrategy::None)
    }

    async fn run_to_running(d: &JobDispatcher, node: &str) -> EncodingTask {
        let task = d.claim_next_task(&TaskFilter::for_node(node)).unwrap();
        assert!(d.start_task(task.id));
        task
    }

    #[tokio::test]
    async fn rejects_invalid_requests_without_side_effects() {
        let d = dispatcher(DispatcherConfig::default());
        let result = d.dispatch(JobRequest::new("", "", "no-such-profile")).await;
        assert!(!result.success);
        assert!(result.job.is_none());
        assert_eq!(result.errors.len(), 3);
        assert!(d.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn analysis_failure_keeps_failed_job() {
        struct Missing;
        #[async_trait::async_trait]
        impl MediaAnalyzer for Missing {
            fn name(&self) -> &'static str {
                "missing"
            }
            async fn analyze(&self, path: &std::path::Path) -> Result<ef_probe::MediaInfo> {
                Err(Error::InputNotFound(path.to_path_buf()))
            }
        }
        let d = JobDispatcher::new(
            DispatcherConfig::default(),
            Arc::new(ProfileStore::in_memory()),
            Arc::new(Missing),
        );
        let result = d.dispatch(request()).await;
        assert!(!result.success);
        let job = result.job.unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.status.error_state, Some(JobState::Analyzing));
        assert!(job.status.error.unwrap().contains("Input not found"));
    }

    #[tokio::test]
    async fn pickup_order_priority_then_age() {
        let d = dispatcher(DispatcherConfig::default());
        let low = d.dispatch(request()).await.job.unwrap();
        let high = d.dispatch(request().priority(10)).await.job.unwrap();

        let first = d.get_next_pending_task(&TaskFilter::any()).unwrap();
        assert_eq!(first.job_id, high.id);
        assert_eq!(first.name, "1080p video");

        d.pause_job(high.id);
        let next = d.get_next_pending_task(&TaskFilter::any()).unwrap();
        assert_eq!(next.job_id, low.id);
        assert_eq!(next.id, low.task_ids[0]);
    }

    #[tokio::test]
    async fn type_filter() {
        let d = dispatcher(DispatcherConfig::default());
        d.dispatch(request()).await;
        let audio = d
            .get_next_pending_task(&TaskFilter::any().with_types([crate::model::JobType::Audio]))
            .unwrap();
        assert_eq!(audio.name, "eng audio aac #1");
        assert!(d
            .get_next_pending_task(&TaskFilter::any().with_types([crate::model::JobType::Master]))
            .is_none());
    }

    #[tokio::test]
    async fn hardware_tasks_wait_for_capable_nodes() {
        let mut config = DispatcherConfig::default();
        config.node_fallback_wait_secs = 3600;
        let d = dispatcher(config);
        d.register_node(NodeId::from("cpu"), vec![]);
        d.register_node(NodeId::from("gpu"), vec![HwAccel::Nvenc]);

        let mut profile = d.profiles().get(HLS_H264_AAC).unwrap();
        profile.id = ef_core::ProfileId::new();
        profile.system = false;
        profile.options.hw_accel = ef_codec::HwAccelPreference::Prefer(HwAccel::Nvenc);
        let req = JobRequest::new("/media/source.mkv", "/out", profile).split(SplitStrategy::None);
        d.dispatch(req).await;

        let cpu_task = d.get_next_pending_task(&TaskFilter::for_node("cpu")).unwrap();
        assert_eq!(cpu_task.job_type, crate::model::JobType::Audio);
        let gpu_task = d.get_next_pending_task(&TaskFilter::for_node("gpu")).unwrap();
        assert_eq!(gpu_task.name, "1080p video");
    }

    #[tokio::test]
    async fn hardware_fallback_after_wait() {
        let mut config = DispatcherConfig::default();
        config.node_fallback_wait_secs = 0;
        let d = dispatcher(config);
        d.register_node(NodeId::from("cpu"), vec![]);
        let mut profile = d.profiles().get(HLS_H264_AAC).unwrap();
        profile.system = false;
        profile.options.hw_accel = ef_codec::HwAccelPreference::Prefer(HwAccel::Qsv);
        d.dispatch(JobRequest::new("/m.mkv", "/out", profile).split(SplitStrategy::None))
            .await;
        let task = d.get_next_pending_task(&TaskFilter::for_node("cpu")).unwrap();
        assert_eq!(task.name, "1080p video");
    }

    #[tokio::test]
    async fn pinned_node() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d
            .dispatch(request().nodes(crate::strategy::NodeStrategy::Specific(NodeId::from("n2"))))
            .await
            .job
            .unwrap();
        assert!(d.get_next_pending_task(&TaskFilter::for_node("n1")).is_none());
        assert_eq!(
            d.get_next_pending_task(&TaskFilter::for_node("n2")).map(|t| t.job_id),
            Some(job.id)
        );
    }

    #[tokio::test]
    async fn concurrency_limit_per_job() {
        let d = dispatcher(DispatcherConfig::default());
        let mut profile = d.profiles().get(HLS_H264_AAC).unwrap();
        profile.system = false;
        profile.options.max_concurrent_jobs = Some(1);
        d.dispatch(JobRequest::new("/m.mkv", "/out", profile).split(SplitStrategy::None))
            .await;
        assert!(d.claim_next_task(&TaskFilter::for_node("n1")).is_some());
        assert!(d.claim_next_task(&TaskFilter::for_node("n1")).is_none());
    }

    #[tokio::test]
    async fn assign_immediately_uses_registered_nodes() {
        let d = dispatcher(DispatcherConfig::default());
        d.register_node(NodeId::from("a"), vec![]);
        d.register_node(NodeId::from("b"), vec![]);
        let job = d
            .dispatch(request().assign_immediately())
            .await
            .job
            .unwrap();
        let tasks = d.tasks_for_job(job.id);
        let assigned: Vec<_> = tasks.iter().filter(|t| t.state == TaskState::Assigned).collect();
        // Four leaves (three rungs + audio) spread over two nodes.
        assert_eq!(assigned.len(), 4);
        let on_a = assigned.iter().filter(|t| t.node_id == Some(NodeId::from("a"))).count();
        assert_eq!(on_a, 2);
        assert_eq!(tasks.last().unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn progress_is_merged_and_averaged() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d.dispatch(request()).await.job.unwrap();
        let task = run_to_running(&d, "n1").await;
        assert!(d.record_progress(
            task.id,
            TaskProgress {
                percentage: 50.0,
                fps: Some(60.0),
                ..Default::default()
            }
        ));
        let stored = d.get_task(task.id).unwrap();
        assert_eq!(stored.progress.fps, Some(60.0));
        let job = d.get_job(job.id).unwrap();
        // One of five tasks at 50%.
        assert!((job.status.progress - 10.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn progress_for_idle_task_is_rejected() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d.dispatch(request()).await.job.unwrap();
        assert!(!d.record_progress(job.task_ids[0], TaskProgress::default()));
    }

    #[tokio::test]
    async fn release_does_not_use_retry_slot() {
        let d = dispatcher(DispatcherConfig::default());
        d.dispatch(request()).await;
        let task = run_to_running(&d, "n1").await;
        let token = d.task_cancellation_token(task.id).unwrap();
        assert!(d.release_task(task.id));
        assert!(token.is_cancelled());

        let task = d.get_task(task.id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.node_id.is_none());
        assert!(!d.release_task(task.id));
    }

    #[tokio::test]
    async fn start_racing_release_leaves_no_live_attempt() {
        let d = dispatcher(DispatcherConfig::default());
        d.dispatch(request()).await;
        for _ in 0..200 {
            let task = d.claim_next_task(&TaskFilter::for_node("n1")).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| d.start_task(task.id));
                s.spawn(|| d.release_task(task.id));
            });
            let stored = d.get_task(task.id).unwrap();
            let token = d.task_cancellation_token(task.id);
            match stored.state {
                TaskState::Pending => assert!(token.is_none()),
                TaskState::Running => {
                    assert!(!token.unwrap().is_cancelled());
                    assert!(d.release_task(task.id));
                }
                other => panic!("unexpected state {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn cancel_task_fails_job_and_retry_restores_it() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d.dispatch(request()).await.job.unwrap();
        let task = run_to_running(&d, "n1").await;
        assert!(d.cancel_task(task.id));
        assert_eq!(d.get_job(job.id).unwrap().state(), JobState::Failed);

        // Failing the job stopped every other task too; the retry brings
        // all of them back.
        let result = d.retry_failed_tasks(job.id);
        assert_eq!(result.retried_count, job.task_ids.len());
        assert_eq!(d.get_job(job.id).unwrap().state(), JobState::Encoding);
        assert!(d
            .tasks_for_job(job.id)
            .iter()
            .all(|t| t.state == TaskState::Pending));
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d.dispatch(request()).await.job.unwrap();
        assert!(d.pause_job(job.id));
        assert!(!d.pause_job(job.id));
        assert!(d.get_next_pending_task(&TaskFilter::any()).is_none());
        assert!(d.resume_job(job.id));
        assert!(d.get_next_pending_task(&TaskFilter::any()).is_some());
        let history: Vec<_> = d
            .get_job(job.id)
            .unwrap()
            .status
            .history
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            history,
            vec![
                JobState::Analyzing,
                JobState::Encoding,
                JobState::Paused,
                JobState::Encoding
            ]
        );
    }

    #[tokio::test]
    async fn warnings_are_recorded() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d.dispatch(request()).await.job.unwrap();
        assert!(d.add_job_warning(job.id, "font extraction failed"));
        assert_eq!(
            d.get_job(job.id).unwrap().status.warnings,
            vec!["font extraction failed".to_string()]
        );
        assert!(!d.add_job_warning(JobId::new(), "x"));
    }

    #[tokio::test]
    async fn manifest_inputs_require_completed_leaves() {
        let d = dispatcher(DispatcherConfig::default());
        let job = d.dispatch(request()).await.job.unwrap();
        assert_matches!(d.manifest_inputs(job.id), Err(Error::Conflict(_)));
        assert_matches!(d.manifest_inputs(JobId::new()), Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn events_use_dispatcher_owned_ids() {
        let a = dispatcher(DispatcherConfig::default());
        let b = dispatcher(DispatcherConfig::default());
        a.dispatch(request()).await;
        b.register_node(NodeId::from("n"), vec![]);
        let first_b = b.events().backlog(1);
        assert_eq!(first_b[0].id, 1);
        assert!(a.events().backlog(1)[0].id > 1);
    }
}
