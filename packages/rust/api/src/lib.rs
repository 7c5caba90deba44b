//! HTTP surface of kwengine.
//!
//! Every handler shares one [`RateLimiter`], so the statistics quota holds
//! across concurrent requests.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kwengine_limiter::RateLimiter;
use kwengine_shared::{EnrichmentDefaults, KwEngineError, Result};
use kwengine_stats::StatsClient;
use kwengine_storage::Storage;

pub mod enrich;
pub mod error;
pub mod health;
pub mod reconcile;
pub mod snapshots;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub provider: Arc<StatsClient>,
    pub limiter: RateLimiter,
    pub defaults: Arc<EnrichmentDefaults>,
    /// Cancelled on server shutdown; running batches drain.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        storage: Storage,
        provider: StatsClient,
        limiter: RateLimiter,
        defaults: EnrichmentDefaults,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            provider: Arc::new(provider),
            limiter,
            defaults: Arc::new(defaults),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/enrich", post(enrich::enrich))
        .route(
            "/reconcile",
            get(reconcile::run_reconcile).post(reconcile::cached_reconcile),
        )
        .route("/snapshots", get(snapshots::list_snapshots))
        .route(
            "/snapshots/:id",
            get(snapshots::get_snapshot)
                .put(snapshots::put_snapshot)
                .delete(snapshots::delete_snapshot),
        )
        .merge(health::health_routes())
        .with_state(state)
}

/// Serve until `state.shutdown` is cancelled.
pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| KwEngineError::config(format!("cannot bind {bind}: {e}")))?;
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    info!(bind = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| KwEngineError::io(bind, e))?;

    info!("server stopped");
    Ok(())
}
