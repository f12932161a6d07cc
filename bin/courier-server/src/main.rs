//! courier-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database, run pending migrations, and fail any task
//!    records left `processing` by a previous run.
//! 4. Wire the orchestration engine: provider adapters, credential cache
//!    (with its eviction sweeper), and the job orchestrator.
//! 5. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod db;
mod error;
mod middleware;
mod providers;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use courier_core::{
    BatchOptions, CredentialCache, CredentialOptions, JobOrchestrator, OrchestratorOptions,
    PollOptions, StreamOptions,
};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::providers::http::HttpProvider;
use crate::providers::token::HttpTokenSource;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: COURIER_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "courier-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    // Records still `processing` lost their drivers with the old process.
    let interrupted = store.interrupt_processing_tasks().await?;
    if interrupted > 0 {
        warn!(interrupted, "failed task records left over from previous run");
    }

    // ── 4. Engine wiring ───────────────────────────────────────────────────────
    let orchestrator = JobOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&store),
        OrchestratorOptions {
            poll: PollOptions {
                interval: cfg.poll_interval,
                max_retries: cfg.poll_max_retries,
            },
            stream: StreamOptions {
                run_timeout: cfg.stream_timeout,
                ..Default::default()
            },
            batch: BatchOptions {
                concurrency: cfg.batch_concurrency,
                ..Default::default()
            },
        },
    );

    let credentials = CredentialCache::new(
        Arc::new(HttpTokenSource::new(&cfg)),
        CredentialOptions::default(),
    );
    let sweeper = credentials.spawn_sweeper();

    let provider = Arc::new(HttpProvider::new(&cfg));

    // ── 5. Shared application state ────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        store,
        orchestrator,
        credentials,
        provider,
    });

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("courier-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
