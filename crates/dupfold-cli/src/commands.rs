use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dupfold")]
#[command(about = "Find duplicate and near-duplicate folders under a root", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan a root and report similar folder groups
    Scan(ScanArgs),
    /// Stage and confirm a quarantine move for folders under a root
    Quarantine(QuarantineArgs),
    /// Display the number of entries in the fingerprint cache
    CacheStats,
    /// Clear the fingerprint cache
    ClearCache,
    /// Print effective configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Root directory to scan
    pub root: PathBuf,

    /// Hash file contents instead of matching on (name, size)
    #[arg(long)]
    pub sha256: bool,

    /// Minimum similarity for near-duplicate grouping
    #[arg(long, default_value_t = 0.80)]
    pub threshold: f64,

    /// Compare folders as bags of files, ignoring relative structure
    #[arg(long)]
    pub bag_of_files: bool,

    /// Only scan files matching these globs (repeatable)
    #[arg(long)]
    pub include: Vec<String>,

    /// Skip paths matching these globs (repeatable, replaces defaults)
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Lowercase names before comparison
    #[arg(long)]
    pub case_insensitive: bool,

    /// Worker pool size cap
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Allow deletion planning against this scan
    #[arg(long)]
    pub enable_deletion: bool,
}

#[derive(Debug, Args)]
pub struct QuarantineArgs {
    /// Root directory the paths live under
    pub root: PathBuf,

    /// Relative folder paths to quarantine
    #[arg(required = true)]
    pub paths: Vec<String>,
}
