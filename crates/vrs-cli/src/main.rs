use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vrs_sync::{StoreMode, SyncConfig};

const DEFAULT_FILTER: &str = "vrs_cli=info,vrs_sync=info,vrs_adapters=info,vrs_storage=info";

#[derive(Debug, Parser)]
#[command(name = "vrs-cli")]
#[command(about = "Venue review sync command-line interface")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass over the catalogue.
    Sync {
        /// Use an in-process store seeded from the capture bundles.
        #[arg(long)]
        memory: bool,
    },
    /// Apply the SQL migrations.
    Migrate,
    /// Register the entities described by the capture bundles.
    Register,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { memory: false }) {
        Commands::Sync { memory } => {
            let mode = if memory {
                StoreMode::Memory
            } else {
                StoreMode::Postgres
            };
            let summary = vrs_sync::run_sync_once(&config, mode).await?;
            let t = &summary.totals;
            println!(
                "sync complete: run_id={} entities={} updated={} failed={} conflicts={} new_reviews={} anomalies={} reports={}",
                summary.run_id,
                t.entities,
                t.updated,
                t.failed,
                t.conflicts,
                t.new_reviews,
                t.anomalies,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            vrs_sync::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Register => {
            let count = vrs_sync::register_captured_entities(&config).await?;
            println!("registered {count} entities from {}", config.captures_dir.display());
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let Some(mut sched) = vrs_sync::maybe_build_scheduler(&config).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let markdown =
                vrs_sync::report_latest_runs(runs, Some(config.workspace_root.clone()))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
