use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use giatar_core::CanonicalKey;
use giatar_query::{AppState, IntroductionOptions, QueryLayer};
use giatar_storage::TableStore;
use giatar_sync::{maybe_build_scheduler, PipelineConfig, SyncPipeline};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "giatar")]
#[command(about = "GIATAR invasive species consolidation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full consolidation pipeline once.
    Sync,
    /// Serve the query API.
    Serve {
        /// Defaults to GIATAR_QUERY_PORT, then 8000.
        #[arg(long)]
        port: Option<u16>,
        /// Also run the sync on GIATAR_SYNC_CRON.
        #[arg(long)]
        with_scheduler: bool,
    },
    /// Resolve a species name or key.
    Lookup { name: String },
    /// Print first introductions as JSON.
    FirstRecords {
        name: String,
        #[arg(long)]
        iso3_only: bool,
        /// Keep native flags exactly as recorded.
        #[arg(long)]
        no_native_inference: bool,
    },
    /// Replace a placeholder key everywhere it is referenced.
    Promote { old: String, new: String },
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} species={} first_records={} needs_review={} reports={}",
                summary.run_id, summary.species, summary.first_records, summary.needs_review, summary.reports_dir
            );
            for (source, stats) in &summary.sources {
                if let Some(err) = &stats.error {
                    println!("  {source}: failed: {err}");
                }
            }
        }
        Commands::Serve { port, with_scheduler } => {
            let port = port.unwrap_or_else(giatar_query::port_from_env);
            let state = AppState::new(config.data_dir.clone());
            // keep the scheduler alive for as long as the server runs
            let _scheduler = if with_scheduler {
                let pipeline = Arc::new(SyncPipeline::from_config(config)?);
                match maybe_build_scheduler(pipeline).await? {
                    Some(sched) => {
                        sched.start().await.context("starting scheduler")?;
                        Some(sched)
                    }
                    None => {
                        warn!("--with-scheduler given but GIATAR_SCHEDULER_ENABLED is not set");
                        None
                    }
                }
            } else {
                None
            };
            info!(port, "starting query server");
            giatar_query::serve(state, port).await?;
        }
        Commands::Lookup { name } => {
            let snapshot = QueryLayer::new(&config.data_dir).load().await?;
            let key = snapshot.resolve(&name)?;
            let display = snapshot.name_for_key(&key).unwrap_or_default();
            println!("{key}\t{display}");
        }
        Commands::FirstRecords {
            name,
            iso3_only,
            no_native_inference,
        } => {
            let snapshot = QueryLayer::new(&config.data_dir).load().await?;
            let key = snapshot.resolve(&name)?;
            let options = IntroductionOptions {
                iso3_only,
                native_inference: !no_native_inference,
            };
            let rows = snapshot.first_introductions(&key, options);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Promote { old, new } => {
            let old: CanonicalKey = old.parse()?;
            let new: CanonicalKey = new.parse()?;
            let store = TableStore::new(&config.data_dir);
            let report = giatar_sync::promote_placeholder(&store, &old, &new).await?;
            println!(
                "promoted {old} -> {new}: {} rows rewritten (linkage={} species={} occurrences={} native={} unmatched={} review={} subtables={})",
                report.total(),
                report.linkage_rows,
                report.species_rows,
                report.occurrence_rows,
                report.native_rows,
                report.unmatched_rows,
                report.review_rows,
                report.subtable_rows
            );
        }
        Commands::Report { runs } => {
            let markdown = giatar_sync::report_recent_markdown(runs, &config.workspace_root)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
