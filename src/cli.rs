use clap::{Parser, Subcommand};
use ef_dispatch::SplitStrategy;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "encodeforge")]
#[command(author, version, about = "Distributed adaptive-bitrate transcoder")]
pub struct Cli {
    /// Path to config file (TOML, or JSON by extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Encode one file with an in-process dispatcher and worker node
    Run {
        /// Source media file
        #[arg(required = true)]
        input: PathBuf,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        /// Profile name, id, or path to a profile JSON file
        #[arg(short, long, default_value = "hls-h264-aac")]
        profile: String,

        /// Job priority (higher runs first)
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Video split strategy: optimal, none, or segments:N
        #[arg(long, default_value = "optimal")]
        split: SplitStrategy,

        /// Retry ceiling for failing tasks
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Analyze a media file and display its streams
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage encoding profiles
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    /// List stored and built-in profiles
    List,

    /// Print one profile as JSON
    Show {
        /// Profile name or id
        name: String,
    },

    /// Check a profile JSON file without saving it
    Validate {
        /// Profile file
        file: PathBuf,
    },

    /// Write every profile as `<name>.json` into a directory
    Export {
        /// Destination directory
        dir: PathBuf,
    },
}
