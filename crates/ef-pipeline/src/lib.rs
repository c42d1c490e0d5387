//! ef-pipeline: executes dispatched tasks on a worker node.
//!
//! The [`TaskExecutor`] turns an [`ef_dispatch::EncodingTask`] into one or
//! more ffmpeg runs, applies the job rules' post-processing actions,
//! validates what was written and reports back through a
//! [`ef_dispatch::TaskReporter`].

pub mod actions;
pub mod command;
pub mod executor;
pub mod layout;
mod master;
pub mod progress;
pub mod rules;
pub mod validate;

pub use actions::{create_actions, run_actions, ActionContext, PostAction, PostActionConfig};
pub use command::CommandBuilder;
pub use executor::{TaskExecutor, TaskOutcome, TaskRunner};
pub use layout::OutputLayout;
pub use progress::ProgressForwarder;
pub use rules::{Condition, Expr, JobRule, RuleContext, RuleEngine};
pub use validate::{validate_output, OutputStats};
