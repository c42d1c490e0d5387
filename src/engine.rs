//! Wiring of the in-process components from a [`Config`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ef_av::{FfprobeAnalyzer, ToolRegistry};
use ef_codec::{CodecRegistry, ProfileStore};
use ef_core::config::Config;
use ef_dispatch::JobDispatcher;
use ef_pipeline::{RuleEngine, TaskExecutor};

/// Dispatcher, executor and their shared stores, built from one config.
pub struct Engine {
    pub config: Config,
    pub tools: Arc<ToolRegistry>,
    pub profiles: Arc<ProfileStore>,
    pub dispatcher: Arc<JobDispatcher>,
    pub executor: Arc<TaskExecutor>,
}

impl Engine {
    /// Build the engine. Requires ffmpeg and ffprobe to be discoverable.
    pub async fn new(config: Config) -> Result<Self> {
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        let ffprobe = tools.ffprobe().context("ffprobe is required to analyze sources")?;
        tools.ffmpeg().context("ffmpeg is required to encode")?;

        let profiles = Arc::new(open_profiles(config.storage.profiles_path.as_deref())?);
        let rules = match &config.storage.rules_path {
            Some(path) => RuleEngine::load(path)
                .with_context(|| format!("failed to load job rules from {}", path.display()))?,
            None => RuleEngine::default(),
        };

        let codecs = match tools.encoder_listing().await {
            Ok(listing) => {
                let available = CodecRegistry::parse_encoder_list(&listing);
                tracing::debug!(encoders = available.len(), "Detected ffmpeg encoders");
                Arc::new(CodecRegistry::with_available_encoders(available))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not list ffmpeg encoders; assuming all are available");
                Arc::new(CodecRegistry::builtin())
            }
        };

        let dispatcher = JobDispatcher::new(
            config.dispatcher.clone(),
            Arc::clone(&profiles),
            Arc::new(FfprobeAnalyzer::new(ffprobe)),
        )
        .with_codec_registry((*codecs).clone());

        let executor = TaskExecutor::new(
            Arc::clone(&tools),
            config.executor.clone(),
            config.storage.work_dir.clone(),
        )
        .with_codec_registry(codecs)
        .with_rules(rules)
        .with_node_accels(config.workers.hw_accels.clone());

        Ok(Self {
            config,
            tools,
            profiles,
            dispatcher: Arc::new(dispatcher),
            executor: Arc::new(executor),
        })
    }
}

/// Profile store at `path`, or the built-ins only.
pub fn open_profiles(path: Option<&Path>) -> Result<ProfileStore> {
    match path {
        Some(path) => ProfileStore::open(path)
            .with_context(|| format!("failed to open profile store {}", path.display())),
        None => Ok(ProfileStore::in_memory()),
    }
}
