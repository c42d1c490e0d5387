//! ef-dispatch: turns encoding jobs into schedulable tasks and owns their
//! lifecycle.
//!
//! A submitted [`JobRequest`] is validated, its source analyzed, and the
//! job decomposed into video, audio and subtitle tasks plus one master task
//! that depends on all of them. Nodes poll [`JobDispatcher`] for work and
//! report back through [`TaskReporter`]; every state transition happens in
//! the dispatcher and is published on its event bus.

pub mod decompose;
pub mod dispatcher;
pub mod model;
pub mod nodes;
pub mod reporter;
pub mod request;
pub mod strategy;

pub use decompose::{plan_tasks, PlannedTask, TaskPlan};
pub use dispatcher::JobDispatcher;
pub use model::{
    CompletedOutput, EncodingJob, EncodingTask, JobOptions, JobState, JobStatus, JobType,
    ManifestInputs, SegmentRange, StateTransition, TaskOutput, TaskProgress, TaskSpec, TaskState,
    VariantOutput,
};
pub use nodes::{NodeInfo, NodeRegistry, TaskFilter};
pub use reporter::TaskReporter;
pub use request::{JobCancelResult, JobDispatchResult, JobRequest, ProfileRef, TaskRetryResult};
pub use strategy::{NodeStrategy, SplitStrategy};
