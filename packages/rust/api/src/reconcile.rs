//! Reconciliation endpoints.

use axum::{
    Json,
    extract::State,
    http::header,
    response::IntoResponse,
};

use kwengine_core::reconcile;
use kwengine_shared::ReconciliationDocument;

use crate::AppState;
use crate::error::ApiResult;

/// GET /reconcile
///
/// Recomputes every pair from the stored snapshots and replaces the cache.
pub async fn run_reconcile(State(state): State<AppState>) -> ApiResult<Json<ReconciliationDocument>> {
    let document = reconcile::reconcile(&state.storage).await?;
    Ok(Json(document))
}

/// POST /reconcile
///
/// Returns the cached document exactly as stored. Never recomputes.
pub async fn cached_reconcile(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let json = reconcile::cached_json(&state.storage).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], json))
}
