//! # Reposync Entry Point
//!
//! Runs the sync service, or a one-off maintenance command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reposync::{
    config::ConfigLoader,
    db,
    repositories::{SeaOrmStore, SyncJobRepository},
    sources::SourceRegistry,
    sync::Syncer,
    telemetry::{current_dispatch, init_tracing},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "reposync", about = "Repository catalog reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler, worker pool and maintenance loops
    Run,
    /// Apply pending database migrations and exit
    Migrate,
    /// Reconcile one external service in the foreground
    Sync {
        #[arg(long)]
        external_service_id: i32,
    },
    /// Enqueue a sync job for one external service
    Trigger {
        #[arg(long)]
        external_service_id: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    init_tracing(&config).context("initializing telemetry")?;
    if let Ok(redacted_json) = config.redacted_json() {
        info!(profile = %config.profile, config = %redacted_json, "Loaded configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db)
        .await
        .context("applying database migrations")?;

    let queue = Arc::new(SyncJobRepository::new(
        db.clone(),
        config.worker.max_num_retries,
    ));
    let syncer = Syncer::new(
        Arc::new(SeaOrmStore::new(db.clone())),
        Arc::new(SourceRegistry::with_defaults()),
        Arc::new(config.sync.clone()),
    )
    .with_logger(current_dispatch());

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => {
            info!("Migrations applied");
        }
        Command::Sync {
            external_service_id,
        } => {
            let cancel = CancellationToken::new();
            let min_interval = config.sync.min_sync_interval();
            syncer
                .sync_external_service(external_service_id, min_interval, &cancel)
                .await
                .with_context(|| format!("syncing external service {external_service_id}"))?;
        }
        Command::Trigger {
            external_service_id,
        } => {
            let enqueued = syncer
                .trigger_external_service_sync(queue.as_ref(), external_service_id)
                .await
                .with_context(|| format!("enqueueing sync for {external_service_id}"))?;
            if !enqueued {
                warn!(external_service_id, "A sync job is already in flight");
            }
        }
        Command::Run => {
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown signal received");
                        signal_token.cancel();
                    }
                    Err(err) => warn!(error = %err, "Failed to listen for shutdown signal"),
                }
            });
            Arc::new(syncer)
                .run(queue, config.worker.clone(), shutdown)
                .await;
        }
    }

    Ok(())
}
