mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, ProfileCommands};
use ef_av::{FfprobeAnalyzer, ToolRegistry};
use ef_codec::EncodingProfile;
use ef_core::config::Config;
use ef_core::events::EventPayload;
use ef_core::JobId;
use ef_dispatch::{JobDispatcher, JobRequest, JobState, ProfileRef, SplitStrategy};
use ef_probe::MediaAnalyzer;
use encodeforge::{engine, Engine, NodeWorker};
use tokio::sync::broadcast::error::RecvError;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick the level from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            input,
            output,
            profile,
            priority,
            split,
            max_retries,
        } => {
            let job = RunArgs {
                input,
                output,
                profile,
                priority,
                split,
                max_retries,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_job(job, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, cli.config.as_deref()))
        }
        Commands::Profiles { command } => profiles(command, cli.config.as_deref()),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("encodeforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

struct RunArgs {
    input: PathBuf,
    output: PathBuf,
    profile: String,
    priority: i32,
    split: SplitStrategy,
    max_retries: Option<u32>,
}

async fn run_job(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path);
    for warning in config.validate() {
        tracing::warn!("Config: {warning}");
    }
    if !args.input.exists() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }

    let profile = profile_reference(&args.profile)?;
    let engine = Engine::new(config).await?;

    let mut request = JobRequest::new(&args.input, &args.output, profile)
        .priority(args.priority)
        .split(args.split);
    if let Some(retries) = args.max_retries {
        request = request.max_task_retries(retries);
    }

    let worker = NodeWorker::new(
        Arc::clone(&engine.dispatcher),
        engine.executor.clone(),
        &engine.config.workers,
    );
    // Register before dispatch so the split strategy sees this node.
    engine
        .dispatcher
        .register_node(worker.node_id().clone(), engine.config.workers.hw_accels.clone());
    let shutdown = worker.shutdown_token();
    let mut events = engine.dispatcher.subscribe();
    let worker_handle = tokio::spawn(worker.run());

    let result = engine.dispatcher.dispatch(request).await;
    let Some(job) = result.job.filter(|_| result.success) else {
        shutdown.cancel();
        let _ = worker_handle.await;
        anyhow::bail!("Job rejected: {}", result.errors.join("; "));
    };
    println!(
        "Job {} queued: {} ({} tasks, profile {})",
        job.id,
        job.label(),
        job.task_ids.len(),
        job.profile.name
    );

    watch_job(&engine.dispatcher, job.id, &mut events).await;
    shutdown.cancel();
    let summary = worker_handle.await.context("worker task failed")?;
    tracing::debug!(?summary, "Worker finished");

    let job = engine
        .dispatcher
        .get_job(job.id)
        .context("job disappeared from the dispatcher")?;
    for warning in &job.status.warnings {
        println!("⚠ {warning}");
    }
    match job.state() {
        JobState::Completed => {
            println!("✓ Completed: {}", job.output_path.display());
            Ok(())
        }
        state => {
            let error = job.status.error.as_deref().unwrap_or("no error recorded");
            anyhow::bail!("Job ended {state:?}: {error}")
        }
    }
}

/// Print progress until the job reaches a terminal state. Ctrl-C cancels it.
async fn watch_job(
    dispatcher: &JobDispatcher,
    job_id: JobId,
    events: &mut tokio::sync::broadcast::Receiver<ef_core::events::Event>,
) {
    let mut last_percent = -1i32;
    let mut interrupted = false;
    loop {
        if dispatcher
            .get_job(job_id)
            .map_or(true, |j| j.state().is_terminal())
        {
            return;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("Interrupted; cancelling job {job_id}");
                dispatcher.cancel_job(job_id);
            }
            event = events.recv() => match event {
                Ok(event) => match event.payload {
                    EventPayload::JobProgress { job_id: id, progress } if id == job_id => {
                        let percent = progress.floor() as i32;
                        if percent > last_percent {
                            last_percent = percent;
                            println!("[{percent:>3}%]");
                        }
                    }
                    EventPayload::TaskFailed { job_id: id, error, will_retry, .. } if id == job_id => {
                        if will_retry {
                            println!("Task failed, retrying: {error}");
                        } else {
                            println!("Task failed: {error}");
                        }
                    }
                    EventPayload::JobWarning { job_id: id, message } if id == job_id => {
                        tracing::warn!("{message}");
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            },
        }
    }
}

/// A `.json` path is loaded as an inline profile; anything else is looked
/// up by name or id.
fn profile_reference(profile: &str) -> Result<ProfileRef> {
    let path = Path::new(profile);
    if path.extension().is_some_and(|e| e == "json") {
        return Ok(ProfileRef::from(load_profile_file(path)?));
    }
    Ok(ProfileRef::from(profile))
}

fn load_profile_file(path: &Path) -> Result<EncodingProfile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    let mut profile: EncodingProfile = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse profile {}", path.display()))?;
    profile.system = false;
    Ok(profile)
}

async fn probe_file(file: &Path, json: bool, config_path: Option<&Path>) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {}", file.display());
    }
    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let analyzer = FfprobeAnalyzer::new(tools.ffprobe()?);
    let media_info = analyzer.analyze(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&media_info)?);
        return Ok(());
    }

    println!("File: {}", media_info.file_path.display());
    println!("Container: {}", media_info.format_name);
    println!("Size: {} bytes", media_info.file_size);
    if let Some(duration) = media_info.duration {
        let secs = duration.as_secs();
        println!("Duration: {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
    }

    println!("\nVideo Tracks: {}", media_info.video_tracks.len());
    for track in &media_info.video_tracks {
        print!("  [{}] {} {}x{}", track.index, track.codec, track.width, track.height);
        if let Some(fps) = track.frame_rate {
            print!(", {fps:.3} fps");
        }
        if let Some(bits) = track.bit_depth {
            print!(", {bits} bit");
        }
        if track.hdr_format.is_hdr() {
            print!(" [{:?}]", track.hdr_format);
        }
        println!();
    }

    println!("\nAudio Tracks: {}", media_info.audio_tracks.len());
    for track in &media_info.audio_tracks {
        print!("  [{}] {} {}ch", track.index, track.codec, track.channels);
        if let Some(lang) = &track.language {
            print!(" ({lang})");
        }
        if track.default {
            print!(" [default]");
        }
        println!();
    }

    println!("\nSubtitle Tracks: {}", media_info.subtitle_tracks.len());
    for track in &media_info.subtitle_tracks {
        print!("  [{}] {}", track.index, track.codec);
        if let Some(lang) = &track.language {
            print!(" ({lang})");
        }
        if track.forced {
            print!(" [forced]");
        }
        if !track.is_text() {
            print!(" [bitmap]");
        }
        println!();
    }

    let fonts = media_info.font_attachments().count();
    if fonts > 0 {
        println!("\nFont attachments: {fonts}");
    }
    Ok(())
}

fn profiles(command: ProfileCommands, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let store = engine::open_profiles(config.storage.profiles_path.as_deref())?;

    match command {
        ProfileCommands::List => {
            for profile in store.list() {
                let marker = if profile.system { " [system]" } else { "" };
                println!(
                    "{:<20} {} video / {} audio / {} subtitle, {}{}",
                    profile.name,
                    profile.video.len(),
                    profile.audio.len(),
                    profile.subtitles.len(),
                    profile.container.format(),
                    marker
                );
            }
        }
        ProfileCommands::Show { name } => {
            let profile = store.resolve(&name)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        ProfileCommands::Validate { file } => {
            let profile = load_profile_file(&file)?;
            let problems = profile.problems();
            if !problems.is_empty() {
                for problem in &problems {
                    println!("✗ {problem}");
                }
                anyhow::bail!("profile '{}' has {} problem(s)", profile.name, problems.len());
            }
            println!("✓ Profile '{}' is valid", profile.name);
        }
        ProfileCommands::Export { dir } => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            for profile in store.list() {
                let path = dir.join(format!("{}.json", profile.name));
                std::fs::write(&path, serde_json::to_string_pretty(&profile)?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available && tool.version_ok != Some(false) {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(version) = &tool.version {
            print!(" ({version})");
        }
        if let Some(path) = &tool.path {
            print!(" - {}", path.display());
        }
        if tool.version_ok == Some(false) {
            print!(" [too old]");
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable encoding.");
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            Config::load(p).with_context(|| format!("invalid config {}", p.display()))?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("✓ Configuration is valid");
    println!("  Node: {}", config.workers.node_name());
    println!(
        "  Workers: video {} / audio {} / subtitle {} / master {}",
        config.workers.video_workers,
        config.workers.audio_workers,
        config.workers.subtitle_workers,
        config.workers.master_workers
    );
    println!("  Max task retries: {}", config.dispatcher.max_task_retries);
    println!("  Work dir: {}", config.storage.work_dir.display());

    let warnings = config.validate();
    for warning in &warnings {
        println!("⚠ {warning}");
    }
    Ok(())
}
