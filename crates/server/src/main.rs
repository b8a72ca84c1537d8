use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use streamload_core::config;
use streamload_queue::{JobStoreOptions, PgJobStore};
use streamload_server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    config::load_dotenv();
    let config = config::Config::from_env();
    config.log_summary();

    let jobs_db = &config.jobs.database;
    let pool = PgPoolOptions::new()
        .max_connections(jobs_db.max_connections)
        .connect_with(jobs_db.connect_options())
        .await
        .with_context(|| format!("connecting to jobs database at {}:{}", jobs_db.host, jobs_db.port))?;

    let store = PgJobStore::new(pool, JobStoreOptions::from_config(&config.jobs));
    store.migrate().await.context("applying job store migrations")?;

    let state = Arc::new(AppState::new(Arc::new(store), config.jobs.queue.clone()));
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on http://localhost:{}", config.server.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server exited cleanly");
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
