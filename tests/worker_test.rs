//! Worker node tests with scripted task runners in place of ffmpeg.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ef_codec::store::HLS_H264_AAC;
use ef_codec::ProfileStore;
use ef_core::FailureKind;
use ef_core::config::WorkersConfig;
use ef_dispatch::{
    EncodingTask, JobDispatcher, JobRequest, JobState, JobType, SplitStrategy, TaskOutput,
    TaskReporter, TaskState,
};
use ef_pipeline::{TaskOutcome, TaskRunner};
use ef_probe::fixtures::{self, StaticAnalyzer};
use encodeforge::{NodeWorker, WorkerPools};

fn dispatcher() -> Arc<JobDispatcher> {
    Arc::new(JobDispatcher::new(
        Default::default(),
        Arc::new(ProfileStore::in_memory()),
        Arc::new(StaticAnalyzer::new(fixtures::sdr_1080p(Duration::from_secs(90)))),
    ))
}

fn workers() -> WorkersConfig {
    WorkersConfig {
        node_id: Some("test-node".into()),
        poll_interval_ms: 20,
        ..Default::default()
    }
}

async fn submit(d: &JobDispatcher) -> ef_dispatch::EncodingJob {
    let result = d
        .dispatch(JobRequest::new("/media/in.mkv", "/out/in", HLS_H264_AAC).split(SplitStrategy::None))
        .await;
    assert!(result.success, "{:?}", result.errors);
    result.job.unwrap()
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Completes every task after a short delay, tracking peak video concurrency.
#[derive(Default)]
struct Completer {
    running_video: AtomicUsize,
    peak_video: AtomicUsize,
}

#[async_trait]
impl TaskRunner for Completer {
    async fn run(&self, task: &EncodingTask, reporter: &dyn TaskReporter) -> TaskOutcome {
        if !reporter.report_started(task.id) {
            return TaskOutcome::Abandoned;
        }
        let video = task.job_type == JobType::Video;
        if video {
            let now = self.running_video.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_video.fetch_max(now, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        if video {
            self.running_video.fetch_sub(1, Ordering::SeqCst);
        }

        let output = TaskOutput {
            path: format!("/out/in/{}.bin", task.seq).into(),
            size: 1,
            variant: None,
        };
        if reporter.report_completed(task.id, output.clone()) {
            TaskOutcome::Completed(output)
        } else {
            TaskOutcome::Abandoned
        }
    }
}

/// Starts a task and holds it until the dispatcher cancels the attempt.
struct Holder;

#[async_trait]
impl TaskRunner for Holder {
    async fn run(&self, task: &EncodingTask, reporter: &dyn TaskReporter) -> TaskOutcome {
        if !reporter.report_started(task.id) {
            return TaskOutcome::Abandoned;
        }
        match reporter.cancellation_token(task.id) {
            Some(token) => token.cancelled().await,
            None => return TaskOutcome::Abandoned,
        }
        TaskOutcome::Cancelled
    }
}

/// Starts a task and then panics.
struct Panicker;

#[async_trait]
impl TaskRunner for Panicker {
    async fn run(&self, task: &EncodingTask, reporter: &dyn TaskReporter) -> TaskOutcome {
        if !reporter.report_started(task.id) {
            return TaskOutcome::Abandoned;
        }
        panic!("runner blew up on {}", task.name);
    }
}

#[tokio::test]
async fn worker_runs_job_to_completion_within_pool_limits() {
    let d = dispatcher();
    let job = submit(&d).await;
    let video_tasks = d
        .tasks_for_job(job.id)
        .iter()
        .filter(|t| t.job_type == JobType::Video)
        .count();
    assert!(video_tasks > 1);

    let runner = Arc::new(Completer::default());
    let worker = NodeWorker::new(Arc::clone(&d), runner.clone(), &workers())
        .with_pools(WorkerPools::new(1, 2, 1, 1));
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for(|| d.get_job(job.id).is_some_and(|j| j.state() == JobState::Completed)).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(summary.completed, job.task_ids.len());
    assert_eq!(summary.released, 0);
    assert_eq!(runner.peak_video.load(Ordering::SeqCst), 1);
    assert!(d
        .tasks_for_job(job.id)
        .iter()
        .all(|t| t.state == TaskState::Completed && t.node_id.as_ref().is_some_and(|n| n.as_str() == "test-node")));
}

#[tokio::test]
async fn shutdown_releases_in_flight_tasks() {
    let d = dispatcher();
    let job = submit(&d).await;

    let worker = NodeWorker::new(Arc::clone(&d), Arc::new(Holder), &workers())
        .with_pools(WorkerPools::new(2, 1, 0, 1));
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    let running = |d: &JobDispatcher| {
        d.tasks_for_job(job.id)
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .count()
    };
    wait_for(|| running(&d) == 3).await;
    // Pools are full: nothing else gets picked up.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(running(&d), 3);

    shutdown.cancel();
    let summary = handle.await.unwrap();
    assert_eq!(summary.released, 3);
    assert_eq!(summary.cancelled, 3);

    let tasks = d.tasks_for_job(job.id);
    assert!(tasks.iter().all(|t| t.state == TaskState::Pending));
    assert!(tasks.iter().all(|t| t.retry_count == 0));
    assert!(!d.get_job(job.id).unwrap().state().is_terminal());
}

#[tokio::test]
async fn panicking_runner_fails_its_task() {
    let d = dispatcher();
    let result = d
        .dispatch(
            JobRequest::new("/media/in.mkv", "/out/in", HLS_H264_AAC)
                .split(SplitStrategy::None)
                .max_task_retries(0),
        )
        .await;
    let job = result.job.unwrap();

    let worker = NodeWorker::new(Arc::clone(&d), Arc::new(Panicker), &workers())
        .with_pools(WorkerPools::new(1, 1, 1, 1));
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    wait_for(|| d.get_job(job.id).is_some_and(|j| j.state() == JobState::Failed)).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert!(summary.failed >= 1);
    assert_eq!(summary.released, 0);
    let tasks = d.tasks_for_job(job.id);
    assert!(tasks.iter().all(|t| t.state.is_terminal()));
    let failed = tasks
        .iter()
        .find(|t| t.state == TaskState::Failed)
        .expect("the panicking task is recorded as failed");
    assert_eq!(failed.failure_kind, Some(FailureKind::Internal));
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("panicked")));
    let job = d.get_job(job.id).unwrap();
    assert!(job.status.error.as_deref().is_some_and(|e| e.contains("panicked")));
}
