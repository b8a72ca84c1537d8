//! ingest-worker: leases download jobs and loads the CSV files they name.
//!
//! Jobs come from the `streamload_jobs` table (see `migrations/`); files are
//! loaded into the target PostgreSQL database. Several workers may run
//! against the same queue.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;

use streamload_core::config::{self, PostgresConfig};
use streamload_core::Config;
use streamload_ingest::{HttpSource, PgTableSink, Pipeline, PipelineOptions, Worker, WorkerOptions};
use streamload_queue::{JobStoreOptions, PgJobStore};

// ── CLI ─────────────────────────────────────────────────────────────

/// Streamload ingest worker: remote CSV files into PostgreSQL tables.
#[derive(Parser, Debug)]
#[command(name = "ingest-worker", version, about)]
struct Cli {
    /// Config profile; keys are looked up as `{PROFILE}_{KEY}` first.
    #[arg(long, env = "STREAMLOAD_PROFILE", default_value = "")]
    profile: String,

    /// Queue to consume (overrides `JOBS_QUEUE`).
    #[arg(long)]
    queue: Option<String>,

    /// Apply job store migrations and exit.
    #[arg(long)]
    migrate_only: bool,
}

async fn connect(pg: &PostgresConfig, what: &str) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(pg.max_connections)
        .connect_with(pg.connect_options())
        .await
        .with_context(|| format!("connecting to {} database at {}:{}", what, pg.host, pg.port))
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    config::load_dotenv();
    let cli = Cli::parse();
    let config = Config::for_profile(&cli.profile);
    config.log_summary();

    let jobs_pool = connect(&config.jobs.database, "jobs").await?;
    let store = PgJobStore::new(jobs_pool, JobStoreOptions::from_config(&config.jobs));
    store.migrate().await.context("applying job store migrations")?;
    info!("job store migrations applied");
    if cli.migrate_only {
        return Ok(());
    }

    if !config.postgres.is_configured() {
        tracing::warn!("PG_USERNAME not set, connecting to the target database as 'postgres'");
    }
    let target_pool = connect(&config.postgres, "target").await?;
    let source = HttpSource::from_config(&config.ingest).context("building HTTP client")?;
    let pipeline = Pipeline::new(
        Arc::new(source),
        Arc::new(PgTableSink::new(target_pool)),
        PipelineOptions::from_config(&config.ingest),
    );

    let mut options = WorkerOptions::from_config(&config.jobs);
    if let Some(queue) = cli.queue {
        options.queue = queue;
    }
    let worker = Worker::new(Arc::new(store), Arc::new(pipeline), options);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, finishing current job");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    info!("ingest-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
