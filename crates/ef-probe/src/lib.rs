//! # ef-probe
//!
//! Source media description consumed by job decomposition.
//!
//! [`MediaInfo`] is a read-only snapshot of a source file: duration, streams
//! with their codecs, resolution, languages, default/forced flags, HDR
//! format, attachments and chapters. Implementations of [`MediaAnalyzer`]
//! produce it; the ffprobe-backed one lives in `ef-av`.

pub mod analyzer;
pub mod types;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use analyzer::MediaAnalyzer;
pub use types::{Attachment, AudioTrack, Chapter, MediaInfo, SubtitleTrack, VideoTrack};
