//! Dispatcher event stream.
//!
//! Every state change the dispatcher makes is published on an [`EventBus`].
//! Workers wake on it instead of polling and the CLI renders job progress
//! from it. The bus also keeps a short backlog for callers that attach late. Event ids come from a counter owned
//! by the bus, so separate dispatcher instances never share a sequence.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::error::FailureKind;
use crate::ids::{JobId, NodeId, TaskId};

/// Size of the backlog kept for late callers.
const BACKLOG_LEN: usize = 100;

// ---------------------------------------------------------------------------
// EventCategory
// ---------------------------------------------------------------------------

/// Coarse grouping used by subscribers to filter the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Job,
    Task,
    Node,
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// What changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Job lifecycle -------------------------------------------------------
    JobQueued {
        job_id: JobId,
        task_count: usize,
    },
    JobStateChanged {
        job_id: JobId,
        from: String,
        to: String,
    },
    JobProgress {
        job_id: JobId,
        progress: f32,
    },
    JobCompleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        error: String,
    },
    JobCancelled {
        job_id: JobId,
        cancelled_tasks: usize,
    },
    JobWarning {
        job_id: JobId,
        message: String,
    },

    // -- Task lifecycle ------------------------------------------------------
    TaskAssigned {
        job_id: JobId,
        task_id: TaskId,
        node_id: NodeId,
    },
    TaskStarted {
        job_id: JobId,
        task_id: TaskId,
    },
    TaskProgress {
        job_id: JobId,
        task_id: TaskId,
        progress: f32,
        fps: Option<f32>,
        eta_secs: Option<f64>,
    },
    TaskCompleted {
        job_id: JobId,
        task_id: TaskId,
    },
    TaskFailed {
        job_id: JobId,
        task_id: TaskId,
        kind: FailureKind,
        error: String,
        will_retry: bool,
    },
    /// Master task dependencies are satisfied; it can now be picked up.
    TaskUnblocked {
        job_id: JobId,
        task_id: TaskId,
    },
    /// A node gave a task back without using a retry slot.
    TaskReleased {
        job_id: JobId,
        task_id: TaskId,
    },
    TaskCancelled {
        job_id: JobId,
        task_id: TaskId,
    },

    // -- Nodes ---------------------------------------------------------------
    NodeRegistered {
        node_id: NodeId,
    },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number, unique within one bus.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Fan-out of dispatcher events plus a bounded backlog.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    backlog: RwLock<VecDeque<Event>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// `capacity` bounds how far a live subscriber may lag before it sees
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            backlog: RwLock::new(VecDeque::with_capacity(BACKLOG_LEN)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish `payload` and return the id it was given.
    pub fn broadcast(&self, category: EventCategory, payload: EventPayload) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            timestamp: Utc::now(),
            category,
            payload,
        };

        {
            let mut backlog = self.backlog.write();
            backlog.push_front(event.clone());
            backlog.truncate(BACKLOG_LEN);
        }

        if self.tx.send(event).is_err() {
            tracing::trace!(event_id = id, "No subscribers for event");
        }
        id
    }

    /// Up to `n` backlog entries, newest first.
    pub fn backlog(&self, n: usize) -> Vec<Event> {
        self.backlog.read().iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_sees_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let job_id = JobId::new();
        let id = bus.broadcast(
            EventCategory::Job,
            EventPayload::JobQueued {
                job_id,
                task_count: 3,
            },
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.category, EventCategory::Job);
        assert!(matches!(
            event.payload,
            EventPayload::JobQueued { job_id: j, task_count: 3 } if j == job_id
        ));
    }

    #[test]
    fn ids_are_per_bus() {
        let a = EventBus::new(4);
        let b = EventBus::new(4);
        let job_id = JobId::new();
        let first = a.broadcast(EventCategory::Job, EventPayload::JobCompleted { job_id });
        let second = a.broadcast(EventCategory::Job, EventPayload::JobCompleted { job_id });
        let other = b.broadcast(EventCategory::Job, EventPayload::JobCompleted { job_id });
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(other, 1);
    }

    #[test]
    fn backlog_capped() {
        let bus = EventBus::new(256);
        let job_id = JobId::new();
        for _ in 0..150 {
            bus.broadcast(EventCategory::Job, EventPayload::JobCompleted { job_id });
        }
        assert_eq!(bus.backlog(200).len(), BACKLOG_LEN);
    }

    #[test]
    fn backlog_newest_first() {
        let bus = EventBus::new(16);
        let job_id = JobId::new();
        for _ in 0..5 {
            bus.broadcast(EventCategory::Job, EventPayload::JobCompleted { job_id });
        }
        bus.broadcast(
            EventCategory::Node,
            EventPayload::NodeRegistered {
                node_id: NodeId::from("n1"),
            },
        );
        let recent = bus.backlog(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].category, EventCategory::Node);
        assert!(recent[0].id > recent[1].id);
    }

    #[test]
    fn publishing_without_subscribers_is_kept_in_backlog() {
        let bus = EventBus::new(4);
        bus.broadcast(
            EventCategory::Task,
            EventPayload::TaskFailed {
                job_id: JobId::new(),
                task_id: TaskId::new(),
                kind: FailureKind::Process,
                error: "exit status 1".into(),
                will_retry: true,
            },
        );
        assert_eq!(bus.backlog(10).len(), 1);
    }

    #[test]
    fn payload_serializes_tagged() {
        let payload = EventPayload::TaskProgress {
            job_id: JobId::new(),
            task_id: TaskId::new(),
            progress: 42.0,
            fps: Some(24.0),
            eta_secs: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "task_progress");
        assert_eq!(json["progress"], 42.0);
    }
}
