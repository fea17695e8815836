use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "chanstore",
    about = "Channel-partitioned embedded storage engine",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a random workload, release part of it and run maintenance
    Run(RunArgs),
    /// Copy every channel's data files to a target directory
    Export(ExportArgs),
    /// Show per-channel file and cache statistics
    Stats(StatsArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

/// Options shared by every command that opens a storage.
#[derive(Args)]
pub struct StorageArgs {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Storage directory, overrides the configuration
    #[arg(short, long)]
    pub dir: Option<PathBuf>,
    /// Channel count, overrides the configuration
    #[arg(long)]
    pub channels: Option<u32>,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
    /// Number of entities to store
    #[arg(short, long, default_value_t = 1000)]
    pub entities: u64,
    /// Payload size in bytes
    #[arg(long, default_value_t = 128)]
    pub payload_size: usize,
    /// Entities stored per task
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
    /// Percentage of stored entities to release afterwards
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub release_percent: u8,
    /// Mirror the storage to this backup directory
    #[arg(long)]
    pub backup: Option<PathBuf>,
}

#[derive(Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
    /// Directory receiving the copies
    #[arg(short, long)]
    pub target: PathBuf,
    /// Skip the full garbage collection before exporting
    #[arg(long)]
    pub no_gc: bool,
}

#[derive(Args)]
pub struct StatsArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Configuration file to validate and print
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}
