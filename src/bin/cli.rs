//! Bike-share ingestion CLI
//!
//! Local execution entry point for discovery, historical ingest, station
//! polling and content crawling.

use std::path::{Path, PathBuf};

use bikeshare_ingest::{
    config::{load_config, resolve_path},
    error::{AppError, Result},
    models::{Config, Manifest},
    pipeline::{self, PipelineContext},
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// bikeshare - Bike-share data ingestion
#[derive(Parser, Debug)]
#[command(
    name = "bikeshare",
    version,
    about = "Ingest bike-share trip archives, station status and site content"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "data/config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a manifest from the publisher's system-data page
    Discover {
        /// Where to write the manifest (default: configured manifest path)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Fetch, normalize and merge every manifest batch
    Ingest {
        /// Manifest file (default: configured manifest path)
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Re-fetch and re-merge batches that are already ingested
        #[arg(long)]
        refresh: bool,
    },

    /// Poll the station status feed
    Poll {
        /// Stop after this many polls (default: run until Ctrl-C)
        #[arg(long)]
        cycles: Option<usize>,
    },

    /// Crawl supporting content
    Crawl {
        /// Seed URLs (default: configured seeds)
        seeds: Vec<String>,
    },

    /// Validate configuration and manifest files
    Validate,

    /// Show the ingest watermark table
    Status,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, default_level: &str) {
    let level = if verbose { "debug" } else { default_level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Load the config file and anchor its relative paths at the file's directory.
fn load(path: &Path) -> Config {
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut config = load_config(path);
    config.paths.storage_dir = resolve_path(base, &config.paths.storage_dir);
    config.paths.staging_dir = resolve_path(base, &config.paths.staging_dir);
    config.paths.manifest_file = resolve_path(base, &config.paths.manifest_file);
    config
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load(&cli.config);
    init_logging(cli.verbose, &config.logging.level);

    log::info!("bikeshare starting...");
    config.validate()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted; stopping at the next suspension point");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Discover { output } => {
            let output = output.unwrap_or_else(|| config.paths.manifest_file.clone());
            let ctx = PipelineContext::from_config(config, cancel)?;
            let manifest = pipeline::run_discovery(&ctx).await?;
            if manifest.resources.is_empty() {
                return Err(AppError::config("No monthly exports found on the listing page"));
            }
            manifest.save(&output)?;
            log::info!(
                "Manifest with {} batches saved to {}",
                manifest.resources.len(),
                output.display()
            );
        }

        Command::Ingest { manifest, refresh } => {
            let manifest_path = manifest.unwrap_or_else(|| config.paths.manifest_file.clone());
            if !manifest_path.exists() {
                log::error!(
                    "Manifest not found at {}. Run 'discover' first.",
                    manifest_path.display()
                );
                return Err(AppError::config("Manifest not found"));
            }
            let manifest = Manifest::load(&manifest_path)?;

            let mut config = config;
            config.fetcher.refresh |= refresh;
            let ctx = PipelineContext::from_config(config, cancel)?;
            let summary = pipeline::run_historical_ingest(&ctx, &manifest).await?;

            for report in &summary.batches {
                let counts = report.counts;
                println!(
                    "{:<10} {:<20} seen={:<8} merged={:<8} duplicate={:<8} rejected={}",
                    report.batch_id,
                    report.outcome.to_string(),
                    counts.seen,
                    counts.merged,
                    counts.duplicate,
                    counts.rejected
                );
            }
            let failures = summary.failures().count();
            if failures > 0 {
                log::warn!("{failures} batches need attention; re-run to retry them");
            }
        }

        Command::Poll { cycles } => {
            let ctx = PipelineContext::from_config(config, cancel)?;
            let poller = ctx.station_poller();
            let polls = pipeline::run_poller(&ctx, &poller, cycles).await?;
            let status = poller.status()?;
            log::info!(
                "{} polls; state {}, {} consecutive failures, {} stale polls",
                polls,
                status.state,
                status.consecutive_failures,
                status.stale_polls
            );
        }

        Command::Crawl { seeds } => {
            let ctx = PipelineContext::from_config(config, cancel)?;
            let summary = pipeline::run_crawl(&ctx, &seeds).await?;
            for skipped in &summary.skipped {
                println!("skipped  {} ({})", skipped.url, skipped.reason);
            }
            for url in &summary.failed {
                println!("failed   {url}");
            }
            log::info!(
                "Crawl complete: {} fetched, {} links left for follow-up",
                summary.fetched.len(),
                summary.unvisited_links.len()
            );
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            log::info!("✓ Config OK ({} schema layouts)", config.normalizer.layouts.len());

            let manifest_path = &config.paths.manifest_file;
            if manifest_path.exists() {
                let manifest = Manifest::load(manifest_path)?;
                if let Err(e) = manifest.validate() {
                    log::error!("Manifest validation failed: {}", e);
                    return Err(e);
                }
                log::info!("✓ Manifest OK ({} batches)", manifest.resources.len());
            } else {
                log::warn!("No manifest at {}", manifest_path.display());
            }

            log::info!("All validations passed!");
        }

        Command::Status => {
            let ctx = PipelineContext::from_config(config, cancel)?;
            let watermarks = ctx.store.watermarks().await?;
            if watermarks.is_empty() {
                log::info!("No batches ingested yet.");
            }
            for wm in watermarks {
                println!(
                    "{:<10} {:<20} seen={:<8} merged={:<8} duplicate={:<8} rejected={:<8} attempts={}{}",
                    wm.batch_id,
                    wm.status.to_string(),
                    wm.counts.seen,
                    wm.counts.merged,
                    wm.counts.duplicate,
                    wm.counts.rejected,
                    wm.attempts,
                    wm.last_error
                        .map(|e| format!("  last error: {e}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    log::info!("Done!");

    Ok(())
}
