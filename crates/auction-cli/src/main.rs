use std::sync::Arc;

use anyhow::{bail, Result};
use auction_sync::{pipeline_from_env, StopReason};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "auction-cli")]
#[command(about = "Auction search scraping and table ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every page of one auction, or of all enabled auctions.
    Scrape {
        #[arg(long)]
        source: Option<String>,
    },
    /// Load pending raw pages into a table (all tables by default) and reconcile it.
    Ingest {
        #[arg(long)]
        table: Option<String>,
    },
    /// Keep only the newest row per partition key.
    Reconcile { table: String },
    /// Reload a table from its latest reconciliation backup.
    Restore { table: String },
    /// Report duplicate rows without changing anything.
    Duplicates { table: String },
    /// Create declared tables that do not exist yet.
    Migrate,
    /// Run the ingest cron job and per-auction scrapes until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let pipeline = pipeline_from_env().await?;

    match cli.command.unwrap_or(Commands::Ingest { table: None }) {
        Commands::Scrape { source } => {
            let runs = match source {
                Some(source_id) => vec![pipeline.scrape_auction(&source_id).await?],
                None => pipeline.scrape_all().await?,
            };
            for run in &runs {
                println!(
                    "scrape {}: pages={} collected={} reported_total={} complete={}",
                    run.source_id,
                    run.pages.len(),
                    run.collected,
                    run.last_reported_total,
                    run.is_complete()
                );
            }
            if runs
                .iter()
                .any(|r| matches!(r.stop, StopReason::FetchFailed { .. } | StopReason::PersistFailed { .. }))
            {
                bail!("one or more scrapes stopped on an error");
            }
        }
        Commands::Ingest { table } => {
            let summaries = match table {
                Some(table) => vec![pipeline.run_table(&table).await?],
                None => pipeline.run_all_tables().await?,
            };
            for summary in summaries {
                println!(
                    "ingest {}: inserted={} archived={} failed_files={} rows_before={} rows_after={}",
                    summary.ingest.table,
                    summary.ingest.records_inserted,
                    summary.ingest.success_count,
                    summary.ingest.failure_count,
                    summary.reconcile.before,
                    summary.reconcile.after
                );
            }
        }
        Commands::Reconcile { table } => {
            let report = pipeline.reconcile_table(&table).await?;
            println!(
                "reconcile {}: before={} after={} removed={}",
                report.table, report.before, report.after, report.removed
            );
        }
        Commands::Restore { table } => {
            let rows = pipeline.restore_table(&table).await?;
            println!("restore {table}: rows={rows}");
        }
        Commands::Duplicates { table } => {
            let stats = pipeline.duplicate_stats(&table).await?;
            println!(
                "duplicates {table}: total={} unique={} duplicates={}",
                stats.total, stats.unique, stats.duplicates
            );
        }
        Commands::Migrate => {
            for table in pipeline.migrate().await? {
                println!("migrate: ensured {table}");
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set AUCTION_SCHEDULER_ENABLED=true");
            };
            sched.start().await?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
            sched.shutdown().await?;
        }
    }

    Ok(())
}
