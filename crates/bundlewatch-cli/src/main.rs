use std::sync::Arc;

use anyhow::{Context, Result};
use bundlewatch_core::{analyze, BundleId, CatalogueStats};
use bundlewatch_storage::{PersistenceGateway, SqliteStore};
use bundlewatch_sync::{maybe_build_scheduler, recent_runs_markdown, CancelFlag, Pipeline, PipelineConfig, RunOptions};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bundlewatch")]
#[command(about = "Storefront bundle price tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan the id range and persist the known-id set.
    Discover,
    /// Discover, fetch, render pending bundles and write reports.
    Run {
        /// Fetch the stored known ids instead of rescanning.
        #[arg(long)]
        skip_discovery: bool,
        #[arg(long)]
        skip_render: bool,
        /// Fetch only ids the scan found since the previous one.
        #[arg(long, conflicts_with = "skip_discovery")]
        only_added: bool,
    },
    /// Render every stored bundle still waiting on the fallback.
    RenderPending,
    /// Fetch one bundle's store page and store it.
    Refresh { id: BundleId },
    /// Bundles with the highest discount.
    Top {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        currency: Option<String>,
    },
    /// Bundles ranked by discount weighted by game count.
    Deals {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 50)]
        min_discount: u8,
    },
    /// Discount authenticity verdict for one stored bundle.
    Analyze { id: BundleId },
    Stats,
    /// Summaries of the newest report directories.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run on the configured cron until interrupted.
    Schedule,
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

async fn open_gateway(config: &PipelineConfig) -> Result<PersistenceGateway> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    Ok(PersistenceGateway::open(Arc::new(store)))
}

fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::default();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            flag.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run {
        skip_discovery: false,
        skip_render: false,
        only_added: false,
    }) {
        Commands::Discover => {
            let pipeline = Pipeline::from_config(&config, false, cancel_on_ctrl_c()).await?;
            let report = pipeline.discover().await?;
            println!(
                "discovery complete: total={} added={} removed={} failed_windows={} persisted={}",
                report.scan.ids.len(),
                report.diff.added.len(),
                report.diff.removed.len(),
                report.scan.windows_failed,
                report.persisted
            );
            if !report.diff.removed.is_empty() {
                println!("removed ids: {:?}", report.diff.removed);
            }
        }
        Commands::Run {
            skip_discovery,
            skip_render,
            only_added,
        } => {
            let pipeline = Pipeline::from_config(&config, !skip_render, cancel_on_ctrl_c()).await?;
            let summary = pipeline
                .run_once(RunOptions {
                    discover: !skip_discovery,
                    render: !skip_render,
                    only_added,
                })
                .await?;
            println!(
                "run complete: run_id={} requested={} stored={} skipped={} failed={}",
                summary.run_id, summary.requested, summary.writes.stored, summary.writes.skipped, summary.writes.failed
            );
            pipeline.gateway().close().await;
        }
        Commands::RenderPending => {
            let pipeline = Pipeline::from_config(&config, true, cancel_on_ctrl_c()).await?;
            let (report, _) = pipeline.render_pending().await?;
            println!(
                "rendering complete: submitted={} resolved={} failed={}",
                report.submitted.len(),
                report.records.len(),
                report.failures.len()
            );
            pipeline.gateway().close().await;
        }
        Commands::Refresh { id } => {
            let pipeline = Pipeline::from_config(&config, false, CancelFlag::default()).await?;
            match pipeline.refresh(id).await? {
                Some(outcome) => print_json(&outcome)?,
                None => println!("bundle {id} not found on the store"),
            }
            pipeline.gateway().close().await;
        }
        Commands::Top { limit, currency } => {
            let gateway = open_gateway(&config).await?;
            print_json(&gateway.query_top_discounted(limit, currency.as_deref()).await?)?;
        }
        Commands::Deals { limit, min_discount } => {
            let gateway = open_gateway(&config).await?;
            print_json(&gateway.query_best_deals(limit, min_discount).await?)?;
        }
        Commands::Analyze { id } => {
            let gateway = open_gateway(&config).await?;
            let record = gateway
                .load_record(id)
                .await?
                .with_context(|| format!("bundle {id} is not stored"))?;
            print_json(&analyze(&record, &config.tuning.analyzer, Utc::now()))?;
        }
        Commands::Stats => {
            let gateway = open_gateway(&config).await?;
            let records = gateway.list_records().await?;
            print_json(&CatalogueStats::from_records(records.iter()))?;
        }
        Commands::Report { runs } => {
            println!("{}", recent_runs_markdown(&config.reports_dir, runs)?);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::from_config(&config, config.render_url.is_some(), CancelFlag::default()).await?);
            let options = RunOptions {
                discover: true,
                render: config.render_url.is_some(),
                only_added: false,
            };
            let Some(sched) = maybe_build_scheduler(pipeline.clone(), config.scheduler_enabled, &config.cron, options).await? else {
                anyhow::bail!("scheduler disabled; set BUNDLEWATCH_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            pipeline.gateway().close().await;
        }
        Commands::Migrate => {
            let store = SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            store.migrate().await?;
            println!("schema ready: {}", config.database_url);
        }
    }

    Ok(())
}
