//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML or JSON and
//! carries the sub-configs for tools, dispatching, worker pools, task
//! execution and storage. Every section defaults sensibly so an empty file
//! is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::media::HwAccel;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub dispatcher: DispatcherConfig,
    pub workers: WorkersConfig,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file, choosing the format by extension
    /// (`.json` is JSON, anything else TOML). `~` in paths is expanded.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents)?,
            _ => Self::from_toml(&contents)?,
        };
        config.expand_paths();
        Ok(config)
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match Self::load(path) {
            Ok(config) => config,
            Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    fn expand_paths(&mut self) {
        for path in [
            &mut self.tools.ffmpeg_path,
            &mut self.tools.ffprobe_path,
            &mut self.storage.profiles_path,
            &mut self.storage.rules_path,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_tilde(path);
        }
        self.storage.work_dir = expand_tilde(&self.storage.work_dir);
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let w = &self.workers;
        for (name, size) in [
            ("video", w.video_workers),
            ("audio", w.audio_workers),
            ("subtitle", w.subtitle_workers),
            ("master", w.master_workers),
        ] {
            if size == 0 {
                warnings.push(format!(
                    "workers.{name}_workers is 0; {name} tasks will never run on this node"
                ));
            }
        }

        for hw in &w.hw_accels {
            if !hw.is_hardware() {
                warnings.push("workers.hw_accels lists 'none'; software encoding is always available".into());
            }
        }

        let d = &self.dispatcher;
        if d.split_min_segment_secs == 0 {
            warnings.push("dispatcher.split_min_segment_secs is 0; splitting is disabled".into());
        } else if d.split_min_duration_secs < d.split_min_segment_secs * 2 {
            warnings.push(format!(
                "dispatcher.split_min_duration_secs ({}) is less than two segments of {}s",
                d.split_min_duration_secs, d.split_min_segment_secs
            ));
        }
        if d.max_task_retries > 10 {
            warnings.push(format!(
                "dispatcher.max_task_retries is {}; failing tasks will be retried many times",
                d.max_task_retries
            ));
        }

        if self.executor.min_output_bytes == 0 {
            warnings.push("executor.min_output_bytes is 0; empty outputs will be accepted".into());
        }

        warnings
    }
}

/// Expand a leading `~` (and environment variables) in a path.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Paths to external CLI tools. `None` means "look up on `PATH`".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Job dispatcher policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Automatic retries per task before the job fails.
    pub max_task_retries: u32,
    /// How long a hardware-preferring task waits for a capable node before
    /// software nodes may take it.
    pub node_fallback_wait_secs: u64,
    /// Sources shorter than this are never split.
    pub split_min_duration_secs: u64,
    /// Lower bound for a single segment range.
    pub split_min_segment_secs: u64,
    /// Upper bound on segment ranges per video output.
    pub split_max_segments: u32,
    /// Broadcast buffer for dispatcher events.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            node_fallback_wait_secs: 30,
            split_min_duration_secs: 600,
            split_min_segment_secs: 120,
            split_max_segments: 8,
            event_capacity: 256,
        }
    }
}

impl DispatcherConfig {
    pub fn node_fallback_wait(&self) -> Duration {
        Duration::from_secs(self.node_fallback_wait_secs)
    }
}

/// Local worker node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Node name; defaults to the `HOSTNAME` environment variable.
    pub node_id: Option<String>,
    /// Hardware encoders available on this node.
    pub hw_accels: Vec<HwAccel>,
    pub video_workers: usize,
    pub audio_workers: usize,
    pub subtitle_workers: usize,
    pub master_workers: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            hw_accels: Vec::new(),
            video_workers: default_video_workers(),
            audio_workers: 2,
            subtitle_workers: 1,
            master_workers: 1,
            poll_interval_ms: 1000,
        }
    }
}

fn default_video_workers() -> usize {
    (num_cpus::get() / 4).clamp(1, 4)
}

impl WorkersConfig {
    /// Resolve the node name.
    pub fn node_name(&self) -> String {
        self.node_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "local".to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Task execution thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Outputs smaller than this are rejected even on a clean exit.
    pub min_output_bytes: u64,
    /// Minimum interval between progress reports for one task.
    pub progress_throttle_ms: u64,
    /// Hard limit for a single external tool invocation.
    pub process_timeout_secs: u64,
    /// Number of trailing diagnostic lines kept for error messages.
    pub diagnostic_tail_lines: usize,
    /// Keep split-encode parts after the master task concatenates them.
    pub keep_intermediates: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_output_bytes: 1024,
            progress_throttle_ms: 500,
            process_timeout_secs: 6 * 60 * 60,
            diagnostic_tail_lines: 40,
            keep_intermediates: false,
        }
    }
}

impl ExecutorConfig {
    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

/// Where profiles and job rules live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub profiles_path: Option<PathBuf>,
    pub rules_path: Option<PathBuf>,
    pub work_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profiles_path: None,
            rules_path: None,
            work_dir: std::env::temp_dir().join("encodeforge"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_valid() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.dispatcher.max_task_retries, 3);
        assert_eq!(config.executor.min_output_bytes, 1024);
        assert_eq!(config.workers.master_workers, 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [dispatcher]
            max_task_retries = 5

            [workers]
            hw_accels = ["nvenc"]
            video_workers = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.max_task_retries, 5);
        assert_eq!(config.dispatcher.node_fallback_wait_secs, 30);
        assert_eq!(config.workers.hw_accels, vec![HwAccel::Nvenc]);
        assert_eq!(config.workers.video_workers, 3);
        assert_eq!(config.workers.audio_workers, 2);
    }

    #[test]
    fn invalid_toml_is_validation_error() {
        let err = Config::from_toml("[dispatcher\nmax").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("config.json");
        std::fs::write(&json, r#"{"executor": {"min_output_bytes": 10}}"#).unwrap();
        assert_eq!(Config::load(&json).unwrap().executor.min_output_bytes, 10);

        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "[executor]\nmin_output_bytes = 20\n").unwrap();
        assert_eq!(Config::load(&toml_path).unwrap().executor.min_output_bytes, 20);
    }

    #[test]
    fn load_or_default_missing_file() {
        let config = Config::load_or_default(Some(Path::new("/nonexistent/encodeforge.toml")));
        assert_eq!(config.dispatcher.max_task_retries, 3);
        let config = Config::load_or_default(None);
        assert_eq!(config.dispatcher.split_max_segments, 8);
    }

    #[test]
    fn defaults_produce_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_zero_pools_and_thresholds() {
        let mut config = Config::default();
        config.workers.master_workers = 0;
        config.dispatcher.split_min_duration_secs = 100;
        config.executor.min_output_bytes = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("master_workers"));
    }

    #[test]
    fn node_name_prefers_explicit() {
        let workers = WorkersConfig {
            node_id: Some("encoder-7".into()),
            ..Default::default()
        };
        assert_eq!(workers.node_name(), "encoder-7");
    }
}
