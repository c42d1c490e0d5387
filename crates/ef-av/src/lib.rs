//! # ef-av
//!
//! External tool plumbing for encodeforge.
//!
//! - **Tool discovery** ([`ToolRegistry`]): locate ffmpeg/ffprobe and check
//!   their versions.
//! - **Process supervision** ([`ToolCommand`]): captured execution for short
//!   probes, streamed and cancellable execution for encodes.
//! - **Progress parsing** ([`ProgressParser`]): ffmpeg stats lines and
//!   `-progress` blocks into [`ProgressSnapshot`]s.
//! - **Media analysis** ([`FfprobeAnalyzer`]): the ffprobe-backed
//!   [`ef_probe::MediaAnalyzer`].
//! - **Actions** ([`actions`]): subtitle sidecars, font extraction, audio
//!   language filtering, concat, mux, HLS packaging, arbitrary commands.

pub mod actions;
pub mod command;
pub mod probe;
pub mod progress;
pub mod tools;

pub use command::{Stream, SupervisedRun, ToolCommand, ToolOutput};
pub use probe::{parse_ffprobe_json, FfprobeAnalyzer};
pub use progress::{ProgressParser, ProgressSnapshot};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry, FFMPEG, FFPROBE};
