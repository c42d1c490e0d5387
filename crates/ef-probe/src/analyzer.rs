//! Analyzer trait definition.

use std::path::Path;

use async_trait::async_trait;
use ef_core::Result;

use crate::types::MediaInfo;

/// Inspects a source file and describes its streams.
#[async_trait]
pub trait MediaAnalyzer: Send + Sync {
    /// Human-readable name of this analyzer implementation.
    fn name(&self) -> &'static str;

    /// Analyze the file at `path`.
    ///
    /// A missing file is reported as [`ef_core::Error::InputNotFound`].
    async fn analyze(&self, path: &Path) -> Result<MediaInfo>;
}
