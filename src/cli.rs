use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ffpilot")]
#[command(author, version, about = "Supervised ffmpeg transcoding")]
pub struct Cli {
    /// Path to config file
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
    /// Transcode inputs into an output file
    Run(RunArgs),

    /// Probe a media file and display information
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// List what the installed ffmpeg supports
    Capabilities {
        /// Catalog to list: codecs, encoders, formats or filters
        kind: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Input file or URL (repeatable)
    #[arg(short, long = "input", required = true)]
    pub inputs: Vec<String>,

    /// Output file
    #[arg(short, long)]
    pub output: String,

    /// Audio codec, e.g. aac or copy
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Video codec, e.g. libx264 or copy
    #[arg(long)]
    pub video_codec: Option<String>,

    /// Output size: 640x480, 640x?, ?x480 or 50%
    #[arg(long)]
    pub size: Option<String>,

    /// Output container format
    #[arg(short, long)]
    pub format: Option<String>,

    /// Kill ffmpeg after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Scheduling priority (-20..19)
    #[arg(long, allow_negative_numbers = true)]
    pub niceness: Option<i32>,

    /// Rewrite FLV metadata after the transcode
    #[arg(long)]
    pub flvmeta: bool,

    /// Extra output option, e.g. --option=-crf --option=23 (repeatable)
    #[arg(long = "option", allow_hyphen_values = true)]
    pub options: Vec<String>,

    /// Overwrite the output if it exists
    #[arg(short = 'y', long)]
    pub overwrite: bool,

    /// Print progress while running
    #[arg(long)]
    pub progress: bool,

    /// Check codecs and formats against ffmpeg before running
    #[arg(long)]
    pub validate: bool,

    /// Print the ffmpeg arguments without running
    #[arg(long)]
    pub dry_run: bool,
}
