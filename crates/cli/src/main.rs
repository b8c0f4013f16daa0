mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use jobs::{
    FfmpegEncoder, JobId, JobRecord, JobStatus, Orchestrator, OutputFormat, RunOutcome,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::block_in_place;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FileConfig, Overrides, RunConfig};

/// How long a cancelled run waits for encoders to report before the summary.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "vidpress")]
#[command(about = "Batch video compression through a bounded pool of ffmpeg workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress video files or every supported video under the given folders
    Compress {
        /// Files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Output container (mp4, webm, mov, avi)
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Constant rate factor, 0 (best) to 51 (smallest)
        #[arg(short, long)]
        quality: Option<u8>,

        /// Drop audio tracks
        #[arg(long)]
        mute: bool,

        /// Write outputs here instead of next to each source
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Number of files encoded at once
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Status drain interval in milliseconds
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Settings file (defaults to the per-user vidpress/settings.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print stream information for a media file as JSON
    Probe {
        /// Media file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Compress {
            paths,
            format,
            quality,
            mute,
            output_dir,
            parallel,
            tick_ms,
            config,
        } => {
            let file = FileConfig::discover(config.as_deref())?;
            let overrides = Overrides {
                parallel,
                tick_ms,
                format,
                quality,
                mute,
                output_dir,
            };
            let run = RunConfig::resolve(file, overrides)?;
            compress(&paths, run).await?;
        }
        Commands::Probe { file } => {
            let info = media_io::probe_media(&file)
                .with_context(|| format!("probe {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

async fn compress(inputs: &[PathBuf], run: RunConfig) -> Result<()> {
    let sources = media_io::resolve_media_paths(inputs);
    if sources.is_empty() {
        bail!("no supported video files found");
    }

    let mut orch = Orchestrator::new(Arc::new(FfmpegEncoder), run.orchestrator)?;
    for source in &sources {
        let size = match std::fs::metadata(source) {
            Ok(meta) => Some(meta.len()),
            Err(err) => {
                warn!("Failed to stat {}: {err}", source.display());
                None
            }
        };
        orch.register_sized(source, size);
    }

    let submitted = orch.start_run(run.encode.clone(), run.parallel)?;
    info!(
        "Compressing {submitted} file(s) to {} with {} worker(s)",
        run.encode.format, run.parallel
    );

    let bar = ProgressBar::new(submitted as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?,
    );

    let mut seen: HashMap<JobId, JobStatus> = HashMap::new();
    let mut interval = tokio::time::interval(run.orchestrator.tick_interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = interval.tick() => {
                // the completing tick joins worker threads
                let report = block_in_place(|| orch.tick());
                if report.dropped > 0 {
                    warn!("Dropped {} stale status event(s)", report.dropped);
                }
                log_changes(&orch.snapshot(), &mut seen, &bar);
                let progress = report.progress;
                bar.set_position(progress.finished() as u64);
                bar.set_message(format!("{} encoding", progress.processing));
                if report.finished {
                    break RunOutcome::AllTerminal;
                }
            }
            _ = &mut ctrl_c => {
                bar.suspend(|| warn!("Interrupted; abandoning queued files"));
                orch.cancel();
                break RunOutcome::Cancelled;
            }
        }
    };

    // Pick up anything workers reported between the last tick and the break.
    let report = if outcome == RunOutcome::Cancelled {
        block_in_place(|| orch.settle(CANCEL_GRACE))
    } else {
        block_in_place(|| orch.tick())
    };
    bar.finish_and_clear();
    if report.progress.processing > 0 {
        warn!(
            "{} encoder(s) did not stop within {:?}",
            report.progress.processing, CANCEL_GRACE
        );
    }

    let records = orch.snapshot();
    print_summary(&records);

    let unfinished = records
        .iter()
        .filter(|r| r.status != JobStatus::Completed)
        .count();
    if outcome == RunOutcome::Cancelled {
        bail!("run cancelled; {unfinished} file(s) not compressed");
    }
    if unfinished > 0 {
        bail!("{unfinished} file(s) failed to compress");
    }
    Ok(())
}

fn log_changes(records: &[JobRecord], seen: &mut HashMap<JobId, JobStatus>, bar: &ProgressBar) {
    for record in records {
        if seen.get(&record.id) == Some(&record.status) {
            continue;
        }
        seen.insert(record.id, record.status);
        let name = record.file_name();
        bar.suspend(|| match record.status {
            JobStatus::Pending => {}
            JobStatus::Processing => info!("Encoding {name}"),
            JobStatus::Completed => info!(
                "Finished {name} ({})",
                record
                    .compressed_size
                    .map(media_io::format_size)
                    .unwrap_or_default()
            ),
            JobStatus::Failed | JobStatus::Errored => warn!(
                "{} {name}: {}",
                record.status,
                record.failure_detail.as_deref().unwrap_or("unknown error")
            ),
        });
    }
}

fn print_summary(records: &[JobRecord]) {
    println!(
        "{:<40} {:<10} {:>12} {:>12} {:>8}  DETAIL",
        "FILE", "STATUS", "ORIGINAL", "COMPRESSED", "SAVED"
    );
    for record in records {
        let original = record.original_size.map(media_io::format_size);
        let compressed = record.compressed_size.map(media_io::format_size);
        println!(
            "{:<40} {:<10} {:>12} {:>12} {:>8}  {}",
            truncate(&record.file_name(), 40),
            record.status.as_str(),
            original.as_deref().unwrap_or("-"),
            compressed.as_deref().unwrap_or("-"),
            savings(record.original_size, record.compressed_size).unwrap_or_else(|| "-".into()),
            record.failure_detail.as_deref().unwrap_or(""),
        );
    }
}

fn savings(original: Option<u64>, compressed: Option<u64>) -> Option<String> {
    let (original, compressed) = (original?, compressed?);
    if original == 0 {
        return None;
    }
    let saved = 100.0 * (1.0 - compressed as f64 / original as f64);
    Some(format!("{saved:.1}%"))
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let head: String = name.chars().take(width.saturating_sub(3)).collect();
    format!("{head}...")
}
