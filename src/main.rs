// ABOUTME: Entry point for the packrat binary.
// ABOUTME: Inspects recovery journals and splits or lists multi-volume archive sets.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use packrat_core::ArchiveDatabase;
use packrat_core::property::filetime_to_datetime;
use packrat_store::config::parse_size;
use packrat_store::{MultiVolumeWriter, PackratConfig, recover};

#[derive(Debug, Parser)]
#[command(name = "packrat", version, about = "Crash-tolerant archive write path tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a recovery journal without modifying it.
    Inspect {
        journal: PathBuf,
        /// Stop replay at checkpoints holding entries under this prefix.
        #[arg(long = "trash")]
        trash_dirs: Vec<String>,
        /// Count recovered entries under this prefix.
        #[arg(long)]
        stats: Option<String>,
        /// Name of the commit marker entry.
        #[arg(long)]
        marker: Option<String>,
        /// Print the recovered database as JSON.
        #[arg(long)]
        json: bool,
        /// List every recovered entry with its size and modification time.
        #[arg(long)]
        entries: bool,
    },
    /// Copy a file into a numbered volume set.
    Split {
        input: PathBuf,
        #[arg(long)]
        prefix: PathBuf,
        /// Volume capacity, such as 650M. Repeat for per-volume sizes.
        #[arg(long = "size", value_parser = parse_size_arg)]
        sizes: Vec<u64>,
    },
    /// List the volumes of an existing set.
    Volumes {
        #[arg(long)]
        prefix: PathBuf,
    },
}

fn parse_size_arg(raw: &str) -> Result<u64, String> {
    parse_size(raw).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("packrat=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PackratConfig::from_env().context("invalid PACKRAT_* configuration")?;

    match cli.command {
        Command::Inspect {
            journal,
            trash_dirs,
            stats,
            marker,
            json,
            entries,
        } => {
            let mut filters = config.resume_filters();
            if !trash_dirs.is_empty() {
                filters.trash_dirs = trash_dirs;
            }
            if let Some(stats) = stats {
                filters.stats_filter = stats;
            }
            if let Some(marker) = marker {
                filters.commit_marker = marker;
            }

            let bytes = fs::read(&journal)
                .with_context(|| format!("reading journal {}", journal.display()))?;
            let recovered = recover(&bytes, &filters)
                .with_context(|| format!("replaying journal {}", journal.display()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&recovered)?);
            } else {
                println!("checkpoints read:      {}", recovered.checkpoints_read);
                println!("checkpoints committed: {}", recovered.checkpoints_committed);
                println!("stopped by:            {:?}", recovered.stop);
                println!("valid offset:          {}", recovered.valid_offset);
                println!("entries:               {}", recovered.db.entries.len());
                println!("folders:               {}", recovered.db.folders.len());
                println!("packed bytes:          {}", recovered.db.total_pack_size());
                println!("recovered files:       {}", recovered.stats.recovered_files);
                println!("recovered bytes:       {}", recovered.stats.recovered_bytes);
                if entries {
                    print_entries(&recovered.db);
                }
            }
        }
        Command::Split {
            input,
            prefix,
            sizes,
        } => {
            let sizes = if sizes.is_empty() {
                config.volume_sizes
            } else {
                sizes
            };
            let mut source =
                File::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let mut out = MultiVolumeWriter::new(&prefix, sizes)?;
            let copied = io::copy(&mut source, &mut out)?;
            out.close()?;
            tracing::info!(bytes = copied, volumes = out.volume_count(), "split complete");
            print_volumes(&out);
        }
        Command::Volumes { prefix } => {
            let mut set = MultiVolumeWriter::new(&prefix, config.volume_sizes)?;
            set.open()?;
            print_volumes(&set);
            println!("total {}", set.len());
        }
    }

    Ok(())
}

fn print_volumes(set: &MultiVolumeWriter) {
    for (path, size) in set.volume_paths().into_iter().zip(set.volume_sizes()) {
        println!("{size:>12}  {}", path.display());
    }
}

fn print_entries(db: &ArchiveDatabase) {
    for (index, entry) in db.entries.iter().enumerate() {
        let mtime = db
            .entry_times(index)
            .mtime
            .and_then(filetime_to_datetime)
            .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M:%S").to_string());
        println!("{:>12}  {mtime:<19}  {}", entry.size, entry.name);
    }
}
