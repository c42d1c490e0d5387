//! Unified error type for encodeforge.
//!
//! All crates funnel their failures into [`Error`]. Task-level failures are
//! classified into a [`FailureKind`] so the dispatcher can report them with a
//! stable category alongside the verbatim message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unified error type covering all failure modes in encodeforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "profile").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation conflicts with the current state of a resource.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed.
    #[error("JSON error: {source}")]
    Json {
        /// The underlying serde_json error.
        #[from]
        source: serde_json::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Captured diagnostic output or description.
        message: String,
    },

    /// Media probing failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// The task input file does not exist.
    #[error("Input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// The tool exited cleanly but its output is missing or implausible.
    #[error("Output validation failed: {0}")]
    OutputValidation(String),

    /// Master manifest assembly failed.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The operation was cancelled cooperatively.
    #[error("Cancelled")]
    Cancelled,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a failure as seen by job status consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad request shape; rejected before any job/task exists.
    Validation,
    /// Task input is missing. Consumes a retry slot like any other failure.
    InputNotFound,
    /// The external tool exited non-zero (or could not be run).
    Process,
    /// The tool exited zero but the artifact is missing or too small.
    OutputValidation,
    /// Master playlist assembly failed. Fails the job without a retry.
    Manifest,
    /// Cooperative cancellation. Never retried.
    Cancelled,
    /// Anything else (I/O, internal bugs).
    Internal,
}

impl FailureKind {
    /// Failures that no further attempt can fix.
    pub fn is_job_fatal(self) -> bool {
        matches!(self, FailureKind::Manifest)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::InputNotFound => "input_not_found",
            FailureKind::Process => "process",
            FailureKind::OutputValidation => "output_validation",
            FailureKind::Manifest => "manifest",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl Error {
    /// Map this error onto the task failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) | Error::NotFound { .. } | Error::Conflict(_) => {
                FailureKind::Validation
            }
            Error::InputNotFound(_) => FailureKind::InputNotFound,
            Error::Tool { .. } | Error::Probe(_) => FailureKind::Process,
            Error::OutputValidation(_) => FailureKind::OutputValidation,
            Error::Manifest(_) => FailureKind::Manifest,
            Error::Cancelled => FailureKind::Cancelled,
            Error::Io { .. } | Error::Json { .. } | Error::Internal(_) => FailureKind::Internal,
        }
    }

    /// Whether this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
