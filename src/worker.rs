//! Local worker node.
//!
//! A [`NodeWorker`] registers with the dispatcher and pulls tasks whose type
//! has a free slot in this node's pools. Each task runs on its own tokio
//! task through a [`TaskRunner`]. The loop wakes on dispatcher events and on
//! the poll interval, whichever comes first. On shutdown, tasks still in
//! flight are released back to the queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ef_core::config::WorkersConfig;
use ef_core::{FailureKind, HwAccel, NodeId, TaskId};
use ef_dispatch::{EncodingTask, JobDispatcher, JobType, TaskFilter};
use ef_pipeline::{TaskOutcome, TaskRunner};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Concurrency limits per task type.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    pools: Vec<(JobType, Arc<Semaphore>)>,
}

impl WorkerPools {
    pub fn new(video: usize, audio: usize, subtitle: usize, master: usize) -> Self {
        let pools = [
            (JobType::Video, video),
            (JobType::Audio, audio),
            (JobType::Subtitle, subtitle),
            (JobType::Master, master),
        ]
        .into_iter()
        .map(|(t, n)| (t, Arc::new(Semaphore::new(n))))
        .collect();
        Self { pools }
    }

    pub fn from_config(config: &WorkersConfig) -> Self {
        Self::new(
            config.video_workers,
            config.audio_workers,
            config.subtitle_workers,
            config.master_workers,
        )
    }

    /// Task types with at least one free slot.
    pub fn free_types(&self) -> Vec<JobType> {
        self.pools
            .iter()
            .filter(|(_, s)| s.available_permits() > 0)
            .map(|(t, _)| *t)
            .collect()
    }

    fn try_acquire(&self, job_type: JobType) -> Option<OwnedSemaphorePermit> {
        let (_, pool) = self.pools.iter().find(|(t, _)| *t == job_type)?;
        Arc::clone(pool).try_acquire_owned().ok()
    }
}

/// Tally of what a worker ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub abandoned: usize,
    pub released: usize,
}

impl WorkerSummary {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed(_) => self.completed += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
            TaskOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

pub struct NodeWorker {
    node_id: NodeId,
    accels: Vec<HwAccel>,
    dispatcher: Arc<JobDispatcher>,
    runner: Arc<dyn TaskRunner>,
    pools: WorkerPools,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl NodeWorker {
    pub fn new(
        dispatcher: Arc<JobDispatcher>,
        runner: Arc<dyn TaskRunner>,
        config: &WorkersConfig,
    ) -> Self {
        Self {
            node_id: NodeId::from(config.node_name()),
            accels: config.hw_accels.clone(),
            dispatcher,
            runner,
            pools: WorkerPools::from_config(config),
            poll_interval: config.poll_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_pools(mut self, pools: WorkerPools) -> Self {
        self.pools = pools;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Cancel this token to stop the worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) -> WorkerSummary {
        self.dispatcher
            .register_node(self.node_id.clone(), self.accels.clone());
        tracing::info!(node_id = %self.node_id, "Worker started");

        let mut events = self.dispatcher.subscribe();
        let mut running: JoinSet<(TaskId, TaskOutcome)> = JoinSet::new();
        let mut in_flight: HashSet<TaskId> = HashSet::new();
        let mut summary = WorkerSummary::default();

        loop {
            self.dispatcher.nodes().heartbeat(&self.node_id);
            while let Some((task, permit)) = self.claim() {
                in_flight.insert(task.id);
                self.spawn(&mut running, task, permit);
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                    Ok((task_id, outcome)) => {
                        in_flight.remove(&task_id);
                        summary.record(&outcome);
                    }
                    Err(e) => tracing::error!(node_id = %self.node_id, error = %e, "Task supervisor failed"),
                },
                event = events.recv() => match event {
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(node_id = %self.node_id, skipped, "Worker lagged behind events");
                    }
                    Err(RecvError::Closed) => tokio::time::sleep(self.poll_interval).await,
                },
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(node_id = %self.node_id, in_flight = in_flight.len(), "Worker shutting down");
        for task_id in &in_flight {
            if self.dispatcher.release_task(*task_id) {
                summary.released += 1;
            }
        }
        while let Some(joined) = running.join_next().await {
            if let Ok((_, outcome)) = joined {
                summary.record(&outcome);
            }
        }
        tracing::info!(node_id = %self.node_id, ?summary, "Worker stopped");
        summary
    }

    fn claim(&self) -> Option<(EncodingTask, OwnedSemaphorePermit)> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let free = self.pools.free_types();
        if free.is_empty() {
            return None;
        }
        let filter = TaskFilter::for_node(self.node_id.clone()).with_types(free);
        let task = self.dispatcher.claim_next_task(&filter)?;
        match self.pools.try_acquire(task.job_type) {
            Some(permit) => Some((task, permit)),
            None => {
                self.dispatcher.release_task(task.id);
                None
            }
        }
    }

    fn spawn(
        &self,
        running: &mut JoinSet<(TaskId, TaskOutcome)>,
        task: EncodingTask,
        permit: OwnedSemaphorePermit,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let runner = Arc::clone(&self.runner);
        let node_id = self.node_id.clone();
        tracing::debug!(node_id = %node_id, task = %task.name, job_type = %task.job_type, "Running task");
        running.spawn(async move {
            let _permit = permit;
            let task_id = task.id;
            let reporter = Arc::clone(&dispatcher);
            // The runner gets its own tokio task so a panic surfaces here,
            // where the task id is still known.
            let attempt = tokio::spawn(async move { runner.run(&task, &*reporter).await });
            let outcome = match attempt.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = format!("task runner panicked: {e}");
                    tracing::error!(node_id = %node_id, task_id = %task_id, "{error}");
                    dispatcher.fail_task_with_kind(task_id, FailureKind::Internal, &error);
                    TaskOutcome::Failed {
                        kind: FailureKind::Internal,
                        error,
                    }
                }
            };
            (task_id, outcome)
        });
    }
}
