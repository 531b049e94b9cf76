// src/server/mod.rs
//! envstore HTTP server
//!
//! Serves the REST API and, for the local blob backend, the `/storage`
//! tree. On startup it forgets worker rows left by earlier runs and waits
//! (bounded) for a worker to announce itself before accepting builds. With
//! `server.standalone = true` a worker pool runs inside the server process.

mod handlers;
pub mod response;
mod routes;

pub use routes::create_router;

use crate::auth::Authenticator;
use crate::context::AppContext;
use crate::db::models::WorkerRecord;
use crate::queue::WorkerPool;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often startup checks for a ready worker
const WORKER_POLL: Duration = Duration::from_millis(500);

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub authenticator: Arc<Authenticator>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>, authenticator: Authenticator) -> Self {
        Self {
            ctx,
            authenticator: Arc::new(authenticator),
        }
    }
}

/// Wait until some worker reports ready; returns whether one did
pub async fn wait_for_worker(ctx: &AppContext, timeout: Duration) -> crate::Result<bool> {
    let started = Instant::now();
    loop {
        if ctx.db(|conn| WorkerRecord::any_ready(conn)).await? {
            return Ok(true);
        }
        if started.elapsed() >= timeout {
            return Ok(false);
        }
        tokio::time::sleep(WORKER_POLL).await;
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}

/// Start the envstore server
pub async fn run_server(ctx: Arc<AppContext>) -> Result<()> {
    let config = &ctx.config;
    let bind_addr = config.bind_addr()?;
    let ready_timeout = config.worker_ready_timeout()?;
    let authenticator = Authenticator::from_config(config).context("Failed to load token signing key")?;

    tracing::info!("Starting envstore server on {}", bind_addr);
    tracing::info!("Database: {}", config.storage.database.display());
    tracing::info!("Store directory: {}", config.storage.store_directory.display());

    let stale = ctx.db(|conn| WorkerRecord::delete_all(conn)).await?;
    if stale > 0 {
        tracing::debug!("Removed {} stale worker record(s)", stale);
    }

    let shutdown = CancellationToken::new();
    let worker = if config.server.standalone {
        let pool = WorkerPool::new(ctx.clone())?;
        tracing::info!("Standalone mode: running worker {} in-process", pool.id());
        let token = shutdown.clone();
        Some(tokio::spawn(async move { pool.run(token).await }))
    } else {
        None
    };

    if wait_for_worker(&ctx, ready_timeout).await? {
        tracing::info!("Worker ready");
    } else {
        tracing::warn!(
            "No worker reported ready within {:?}; builds will stay queued until one starts",
            ready_timeout
        );
    }

    let state = AppState::new(ctx.clone(), authenticator);
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!("envstore is ready to serve");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(worker) = worker {
        worker.await.context("Worker task panicked")??;
    }
    Ok(())
}
