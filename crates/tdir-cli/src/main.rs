use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tdir_adapters::TemplateExtractor;
use tdir_sync::passes::{self, BuildPaths};
use tdir_sync::{finish_pass, Enricher, HttpPageClient, ReconcileConfig, SourceRegistry};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tdir-cli")]
#[command(about = "Tool directory reconciliation passes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract canonical entity URLs from a panel column.
    ExtractUrls {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "internal_link")]
        column: String,
        #[arg(long, default_value = "clean_urls.csv")]
        output: PathBuf,
    },
    /// Resumable scan of every registry source into the bulk output.
    Build {
        #[arg(long, default_value = "clean_urls.csv")]
        targets: PathBuf,
        #[arg(long, default_value = "scan_checkpoint.log")]
        checkpoint: PathBuf,
        #[arg(long, default_value = "directory_bulk.csv")]
        output: PathBuf,
        #[arg(long, default_value = "missing_urls.csv")]
        missing: PathBuf,
        /// Also rewrite this directory file once the scan is complete.
        #[arg(long)]
        directory: Option<PathBuf>,
        /// Stop after this many entities.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Fill still-missing entities from one archive source.
    Backfill {
        #[arg(long, default_value = "new_directory.csv")]
        directory: PathBuf,
        #[arg(long, default_value = "missing_urls.csv")]
        missing: PathBuf,
        /// Registry source id to scan.
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "still_missing_urls.csv")]
        still_missing: PathBuf,
    },
    /// Apply a liveness check and refresh live entities.
    Refresh {
        #[arg(long, default_value = "new_directory.csv")]
        directory: PathBuf,
        #[arg(long)]
        liveness: PathBuf,
        #[arg(long)]
        live_source: Option<String>,
        #[arg(long)]
        archive_source: Option<String>,
    },
    /// Apply redirect observations (renames and exits).
    Redirects {
        #[arg(long, default_value = "new_directory.csv")]
        directory: PathBuf,
        #[arg(long, default_value = "url_status_checked.csv")]
        status: PathBuf,
    },
    /// Fill missing names and release dates from live pages and the archive.
    Enrich {
        #[arg(long, default_value = "new_directory.csv")]
        directory: PathBuf,
    },
    /// Append directory entities from a `tool_id` list to a year/name/url listing.
    ExportListing {
        #[arg(long, default_value = "new_directory.csv")]
        directory: PathBuf,
        #[arg(long, default_value = "missed_live.csv")]
        reference: PathBuf,
        /// Existing listing whose rows are kept ahead of the new ones.
        #[arg(long)]
        base: Option<PathBuf>,
        #[arg(long, default_value = "listing.csv")]
        output: PathBuf,
    },
    /// Export exited and renamed entity keys.
    Inactive {
        #[arg(long, default_value = "new_directory.csv")]
        directory: PathBuf,
        #[arg(long, default_value = "inactive_or_old_urls.csv")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ReconcileConfig::from_env();
    let started_at = Utc::now();
    let root = config.workspace_root.clone();

    let outcome = match cli.command {
        Commands::ExtractUrls {
            input,
            column,
            output,
        } => passes::extract_urls(&input, &column, &output, &config.site_host, config.chunk_size)?,
        Commands::Build {
            targets,
            checkpoint,
            output,
            missing,
            directory,
            limit,
        } => {
            let registry = SourceRegistry::load(config.registry_path())?;
            let sources = registry.scan_sources(&root, &config.site_host)?;
            let paths = BuildPaths {
                targets: &targets,
                checkpoint: &checkpoint,
                output: &output,
                missing: &missing,
                directory: directory.as_deref(),
            };
            passes::build(sources, config.chunk_size, config.batch_size, &paths, limit)?
        }
        Commands::Backfill {
            directory,
            missing,
            source,
            still_missing,
        } => {
            let registry = SourceRegistry::load(config.registry_path())?;
            let source = registry.scan_source(&source, &root, &config.site_host)?;
            passes::backfill(&directory, &missing, &source, config.chunk_size, &still_missing)?
        }
        Commands::Refresh {
            directory,
            liveness,
            live_source,
            archive_source,
        } => {
            let registry = SourceRegistry::load(config.registry_path())?;
            let resolve = |id: Option<String>| {
                id.map(|id| registry.scan_source(&id, &root, &config.site_host))
                    .transpose()
            };
            let live = resolve(live_source)?;
            let archive = resolve(archive_source)?;
            passes::refresh(
                &directory,
                &liveness,
                live.as_ref(),
                archive.as_ref(),
                config.chunk_size,
            )?
        }
        Commands::Redirects { directory, status } => {
            passes::redirects(&directory, &status, &config.lifecycle_rules(), config.chunk_size)?
        }
        Commands::Enrich { directory } => {
            let enricher = Enricher::new(
                Box::new(HttpPageClient::from_config(&config)?),
                Box::new(TemplateExtractor::new()?),
                config.era_policy(),
                config.live_workers,
                config.archive_workers,
                passes::today(),
            );
            passes::enrich(&directory, &enricher).await?
        }
        Commands::ExportListing {
            directory,
            reference,
            base,
            output,
        } => passes::export_listing(
            &directory,
            &reference,
            base.as_deref(),
            &output,
            config.chunk_size,
        )?,
        Commands::Inactive { directory, output } => passes::inactive(&directory, &output)?,
    };

    let report_path = finish_pass(&config, started_at, &outcome).await?;
    info!(report = %report_path.display(), "run report written");
    println!("{}", outcome.summary);
    Ok(())
}
