use std::sync::Arc;

use anyhow::{Context, Result};
use atlas_core::{Source, Trigger};
use atlas_store::Store;
use atlas_sync::{scheduler_loop, Connectors, EngineConfig, Orchestrator, Reconciler};
use atlas_web::AppState;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "atlas-cli")]
#[command(about = "Atlas device inventory sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API together with the hourly scheduler.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Run one sync to completion and print the ledger summary.
    Sync {
        /// asset-system, directory-system or network-system
        source: Option<Source>,
        /// Sync every source in turn.
        #[arg(long)]
        all: bool,
    },
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Serve { port } => {
            let store = Store::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;

            let connectors =
                Arc::new(Connectors::from_config(&config).context("building connectors")?);
            let orchestrator = Arc::new(Orchestrator::new(store.clone(), Arc::clone(&connectors)));
            let reconciler = Arc::new(Reconciler::new(store, connectors));

            let (stop_tx, stop_rx) = watch::channel(false);
            let scheduler = tokio::spawn(scheduler_loop(
                Arc::clone(&orchestrator),
                config.schedule_timezone,
                stop_rx,
            ));

            let state = AppState {
                orchestrator,
                reconciler,
                timezone: config.schedule_timezone,
            };
            tokio::select! {
                result = atlas_web::serve(state, port) => result?,
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }

            let _ = stop_tx.send(true);
            let _ = scheduler.await;
        }
        Commands::Sync { source, all } => {
            let store = Store::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            let connectors = Connectors::from_config(&config).context("building connectors")?;

            let sources: Vec<Source> = if all {
                Source::ALL.to_vec()
            } else {
                vec![source.context("pass a source or --all")?]
            };

            for source in sources {
                match atlas_sync::run_blocking(&store, &connectors, source, Trigger::Cron).await? {
                    Some(job) => println!(
                        "{}: {} processed={} failed={}{}",
                        source,
                        job.state,
                        job.records_processed,
                        job.records_failed,
                        job.error_message
                            .map(|m| format!(" ({m})"))
                            .unwrap_or_default(),
                    ),
                    None => println!("{source}: skipped, already running"),
                }
            }
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
