use std::time::Instant;

use anyhow::Context;
use colored::Colorize;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use chanstore_backup::BackupConfig;
use chanstore_engine::{StorageConfig, StorageStatistics, StorageSystem};
use chanstore_types::EntityId;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args, &cli.format),
        Command::Export(args) => cmd_export(args, &cli.format),
        Command::Stats(args) => cmd_stats(args, &cli.format),
        Command::Config(args) => cmd_config(args),
    }
}

fn load_config(args: &StorageArgs) -> anyhow::Result<StorageConfig> {
    let mut config = match &args.config {
        Some(path) => {
            StorageConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => StorageConfig::default(),
    };
    if let Some(dir) = &args.dir {
        config.storage_directory = dir.clone();
    }
    if let Some(channels) = args.channels {
        config.channel_count = channels;
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct RunReport {
    stored: usize,
    bytes: u64,
    released: usize,
    swept: usize,
    elapsed_ms: u128,
    statistics: StorageStatistics,
}

fn cmd_run(args: RunArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let mut config = load_config(&args.storage)?;
    if let Some(directory) = args.backup {
        config.backup = Some(BackupConfig {
            directory,
            ..config.backup.unwrap_or_default()
        });
    }
    config.validate()?;

    let started = Instant::now();
    let mut system = StorageSystem::start(config).context("starting storage")?;
    info!(channels = %system.channel_count(), "storage started");

    let mut rng = rand::thread_rng();
    let mut stored = 0;
    let mut bytes = 0;
    let ids: Vec<EntityId> = (1..=args.entities).map(EntityId::new).collect();
    for batch in ids.chunks(args.batch_size.max(1)) {
        let entities = batch
            .iter()
            .map(|&id| {
                let mut payload = vec![0u8; args.payload_size];
                rng.fill(&mut payload[..]);
                (id, payload)
            })
            .collect();
        let receipt = system.store(entities)?;
        debug!(entities = receipt.entities, bytes = receipt.bytes, "batch stored");
        stored += receipt.entities;
        bytes += receipt.bytes;
    }

    let release_count = ids.len() * usize::from(args.release_percent) / 100;
    let released = system.release(&ids[..release_count])?;
    let collected = system.collect_garbage(None)?;
    system.check_files(None)?;
    let statistics = system.statistics()?;
    system.shutdown()?;

    let report = RunReport {
        stored,
        bytes,
        released,
        swept: collected.swept,
        elapsed_ms: started.elapsed().as_millis(),
        statistics,
    };
    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Text => {
            println!(
                "{} Stored {} entities ({} bytes)",
                "✓".green().bold(),
                report.stored.to_string().bold(),
                report.bytes,
            );
            println!("  Released: {}", report.released.to_string().yellow());
            println!("  Swept: {}", report.swept.to_string().yellow());
            println!("  Elapsed: {} ms", report.elapsed_ms);
            print_statistics(&report.statistics);
            Ok(())
        }
    }
}

fn cmd_export(args: ExportArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(&args.storage)?;
    let mut system = StorageSystem::start(config).context("starting storage")?;
    let exported = system.export_channels(&args.target, !args.no_gc)?;
    system.shutdown()?;

    match format {
        OutputFormat::Json => print_json(&exported),
        OutputFormat::Text => {
            for file in &exported {
                println!(
                    "  {} {}/{} ({} bytes)",
                    "exported:".green(),
                    file.channel,
                    file.name,
                    file.length,
                );
            }
            println!(
                "{} Exported {} files to {}",
                "✓".green().bold(),
                exported.len().to_string().bold(),
                args.target.display()
            );
            Ok(())
        }
    }
}

fn cmd_stats(args: StatsArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(&args.storage)?;
    let mut system = StorageSystem::start(config).context("starting storage")?;
    let statistics = system.statistics()?;
    system.shutdown()?;

    match format {
        OutputFormat::Json => print_json(&statistics),
        OutputFormat::Text => {
            print_statistics(&statistics);
            Ok(())
        }
    }
}

fn print_statistics(statistics: &StorageStatistics) {
    println!(
        "Storage: {} entities in {} files, {} of {} bytes live",
        statistics.entity_count().to_string().bold(),
        statistics.file_count(),
        statistics.data_length(),
        statistics.total_length()
    );
    for channel in &statistics.channels {
        println!(
            "  {}  head {}  entities {}  cached {} bytes  pending deletes {}",
            channel.channel.to_string().cyan(),
            channel.head_file.to_string().yellow(),
            channel.entity_count,
            channel.cached_bytes,
            channel.pending_deletes
        );
        for file in &channel.files {
            println!(
                "    {} {}/{} bytes",
                file.number.to_string().dimmed(),
                file.data_length,
                file.total_length,
            );
        }
    }
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = match &args.file {
        Some(path) => {
            let config = StorageConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            eprintln!("{} {} is valid", "✓".green().bold(), path.display());
            config
        }
        None => StorageConfig::default(),
    };
    print!("{}", config.to_toml_string()?);
    Ok(())
}
