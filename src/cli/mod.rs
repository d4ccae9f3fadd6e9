//! Command-line interface for parlingest

mod commands;

pub use commands::*;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parlingest - Italian parliamentary document ingestion
///
/// Harvests stenographic reports, video transcripts, and institutional
/// documents, mirrors them into Google Cloud Storage, and keeps the ingest
/// manifests up to date.
#[derive(Parser, Debug)]
#[command(name = "parlingest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PARLINGEST_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline (download, upload, rename) per configured source
    Run(RunArgs),

    /// Download Chamber of Deputies stenographic reports
    Camera(CameraArgs),

    /// Download Senate sitting reports
    Senato(SenatoArgs),

    /// Download YouTube transcripts and metadata
    Youtube(YoutubeArgs),

    /// Download documents from a Google Drive folder
    Drive(DriveArgs),

    /// Upload a directory to GCS and rebuild the ingest manifest
    Upload(UploadArgs),

    /// Rename GCS objects with Gemini and patch the batch manifest
    Rename(RenameArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Local root where sources keep their download directories
    #[arg(short, long)]
    pub out: PathBuf,

    /// Only process the source with this name
    #[arg(short, long)]
    pub source: Option<String>,

    /// Start date (YYYY-MM-DD), used when GCS has no previous upload
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// End date (YYYY-MM-DD), default: today
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Skip the download phase
    #[arg(long)]
    pub skip_download: bool,

    /// Skip the upload phase
    #[arg(long)]
    pub skip_upload: bool,

    /// Skip the rename phase
    #[arg(long)]
    pub skip_rename: bool,

    /// Empty the GCS prefix before uploading
    #[arg(long)]
    pub refresh_gcs: bool,
}

/// Arguments for the camera command
#[derive(Parser, Debug)]
pub struct CameraArgs {
    /// Output directory
    #[arg(short, long)]
    pub out: PathBuf,

    /// Starting legislature (others are discovered from the date range)
    #[arg(short, long, default_value = "19")]
    pub leg: String,

    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// End date (YYYY-MM-DD), default: today
    #[arg(long)]
    pub to: Option<NaiveDate>,
}

/// Arguments for the senato command
#[derive(Parser, Debug)]
pub struct SenatoArgs {
    /// Output directory
    #[arg(short, long)]
    pub out: PathBuf,

    /// Legislature whose listings are scanned
    #[arg(short, long, default_value = "19")]
    pub leg: String,

    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// End date (YYYY-MM-DD), default: today
    #[arg(long)]
    pub to: Option<NaiveDate>,
}

/// Arguments for the youtube command
#[derive(Parser, Debug)]
pub struct YoutubeArgs {
    /// Output directory
    #[arg(short, long)]
    pub out: PathBuf,

    /// Only this channel id, instead of every configured channel
    #[arg(long)]
    pub channel: Option<String>,

    /// Data API key (default: the environment variable named in the config)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// End date (YYYY-MM-DD), default: today
    #[arg(long)]
    pub to: Option<NaiveDate>,
}

/// Arguments for the drive command
#[derive(Parser, Debug)]
pub struct DriveArgs {
    /// Output directory
    #[arg(short, long)]
    pub out: PathBuf,

    /// Root folder id (default: the configured drive source)
    #[arg(long)]
    pub folder_id: Option<String>,

    /// Maximum folder recursion depth
    #[arg(long, default_value = "2")]
    pub max_depth: u32,

    /// Only files created on or after this date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,
}

/// Arguments for the upload command
#[derive(Parser, Debug)]
pub struct UploadArgs {
    /// Source directory to upload
    #[arg(short, long)]
    pub src: PathBuf,

    /// Destination bucket
    #[arg(short, long)]
    pub bucket: String,

    /// Destination prefix within the bucket
    #[arg(short, long, default_value = "")]
    pub prefix: String,

    /// Glob patterns selecting the files to upload
    #[arg(long, value_delimiter = ',', default_values_t = ["*.pdf".to_string(), "*.json".to_string()])]
    pub patterns: Vec<String>,

    /// Empty the prefix before uploading
    #[arg(long)]
    pub refresh: bool,
}

/// Arguments for the rename command
#[derive(Parser, Debug)]
pub struct RenameArgs {
    /// Target location, as gs://bucket/prefix
    #[arg(required = true)]
    pub gcs_input: String,

    /// Concurrent rename workers (default: from config)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Configuration subcommand
    #[command(subcommand)]
    pub command: ConfigCommands,
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Initialize configuration file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
