use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use groupsync_storage::{FileGroupStore, GroupStore};
use groupsync_sync::{
    load_config, maybe_build_scheduler, orchestrator_from_settings, report_markdown, run_import_once,
    ImporterSettings,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "groupsync")]
#[command(about = "Reconcile group memberships from external sources into the group store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every configured source once.
    Run,
    /// Parse and validate an importer config without fetching anything.
    Validate {
        /// Defaults to GROUPSYNC_CONFIG.
        path: Option<PathBuf>,
    },
    /// Fetch and plan every source, print the plans as JSON, apply nothing.
    Plan,
    /// Run imports on the GROUPSYNC_CRON schedule until interrupted.
    Schedule,
    /// Serve the JSON status API.
    Serve,
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = ImporterSettings::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let run = run_import_once(&settings).await?;
            let (changed, removed) = run.totals();
            println!(
                "import complete: run_id={} sources={} changed={} removed={}",
                run.run_id,
                run.per_source_results.len(),
                changed,
                removed
            );
            for (source_id, outcome) in &run.per_source_results {
                if outcome.is_failure() {
                    eprintln!("{source_id}: {}", serde_json::to_string(outcome)?);
                }
            }
            if run.has_failures() {
                anyhow::bail!("import run {} finished with failing sources", run.run_id);
            }
        }
        Commands::Validate { path } => {
            let path = path.unwrap_or_else(|| settings.config_path.clone());
            let config = load_config(&path)?;
            println!("{}: {} sources ok", path.display(), config.sources().len());
        }
        Commands::Plan => {
            let config = load_config(&settings.config_path)?;
            let orchestrator = orchestrator_from_settings(&settings).await?;
            let reports = orchestrator.plan_only(&config).await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            let failed = reports.iter().filter(|r| r.error.is_some()).count();
            if failed > 0 {
                anyhow::bail!("{failed} sources could not be planned");
            }
        }
        Commands::Schedule => {
            let Some(sched) = maybe_build_scheduler(&ImporterSettings {
                scheduler_enabled: true,
                ..settings.clone()
            })
            .await?
            else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %settings.cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
        }
        Commands::Serve => groupsync_web::serve_from_env().await?,
        Commands::Report { runs } => {
            let store = FileGroupStore::open(&settings.state_dir).await?;
            let runs = store.list_runs(runs).await?;
            println!("{}", report_markdown(&runs));
        }
    }

    Ok(())
}
