use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bricksync_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bricksync")]
#[command(about = "Reload the brick catalog and refresh its derived rollups")]
struct Cli {
    /// Print run summaries as JSON instead of a one-line digest.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture set ids, apply the generated statement files, refresh rollups.
    Sync,
    /// Refresh the rollups against the data already in the store.
    Rollup,
    /// Create the derived tables if they are missing.
    Schema,
    /// Print the current recent additions and popularity snapshots by theme.
    Show,
    /// Run the sync on its cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine; the process environment still applies
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "bricksync failed");
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline.run_once().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} statements={} statement_failures={} new_sets={} recent_inserted={} popular_inserted={} popular_pruned={} rollup_failures={}",
                    summary.run_id,
                    summary.load.executed(),
                    summary.load.failed(),
                    summary.rollup.new_item_ids,
                    summary.rollup.recent_rows_inserted,
                    summary.rollup.popular_rows_inserted,
                    summary.rollup.popular_rows_pruned,
                    summary.rollup.failed_steps.len(),
                );
            }
        }
        Commands::Rollup => {
            let report = pipeline.run_rollups_only().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "rollup complete: run_id={} popular_inserted={} popular_pruned={} failures={}",
                    report.run_id,
                    report.popular_rows_inserted,
                    report.popular_rows_pruned,
                    report.failed_steps.len(),
                );
            }
        }
        Commands::Schema => {
            let mut store = pipeline.connect().await?;
            store.ensure_derived_schema().await?;
            store.close().await?;
            println!("derived schema ready");
        }
        Commands::Show => {
            let mut store = pipeline.connect().await?;
            let themes = store.categories().await?;
            let recent = store.recent_additions().await?;
            let popular = store.popularity_snapshots().await?;
            store.close().await?;
            if cli.json {
                let body = serde_json::json!({
                    "themes": themes,
                    "recent_set_additions": recent,
                    "popular_themes": popular,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                let names: HashMap<i64, &str> =
                    themes.iter().map(|t| (t.id, t.name.as_str())).collect();
                let label = |id: i64| names.get(&id).copied().unwrap_or("?");
                println!("## recent_set_additions");
                for row in &recent {
                    println!(
                        "- {} ({}): {} (added {})",
                        label(row.theme_id),
                        row.theme_id,
                        row.set_num,
                        row.added_date
                    );
                }
                println!("\n## popular_themes");
                for row in &popular {
                    println!(
                        "- {} {} ({}): {}",
                        row.snapshot_date,
                        label(row.theme_id),
                        row.theme_id,
                        row.collection_count
                    );
                }
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = maybe_build_scheduler(Arc::clone(&pipeline)).await? else {
                anyhow::bail!("scheduler disabled; set BRICKSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
