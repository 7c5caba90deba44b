//! Subcluster snapshot endpoints, written by the curation workflow.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::Value;
use tracing::info;

use kwengine_shared::SubclusterSnapshot;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// GET /snapshots
pub async fn list_snapshots(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<SubclusterSnapshot>>> {
    Ok(Json(state.storage.list_snapshots().await?))
}

/// GET /snapshots/:id
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SubclusterSnapshot>> {
    state
        .storage
        .get_snapshot(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("snapshot {id}")))
}

/// PUT /snapshots/:id
///
/// The body's `subclusterId` may be omitted; when present it must match the
/// path.
pub async fn put_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut body): Json<Value>,
) -> ApiResult<Json<SubclusterSnapshot>> {
    let object = body
        .as_object_mut()
        .ok_or_else(|| ApiError::BadRequest("snapshot must be a JSON object".into()))?;

    match object.get("subclusterId") {
        None => {
            object.insert("subclusterId".into(), Value::String(id.clone()));
        }
        Some(Value::String(body_id)) if *body_id == id => {}
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "subclusterId {other} does not match path id {id}"
            )));
        }
    }

    let snapshot = SubclusterSnapshot::from_value(body)?;
    state.storage.upsert_snapshot(&snapshot).await?;
    info!(
        subcluster_id = %snapshot.subcluster_id,
        phrases = snapshot.filtered_queries.len(),
        "snapshot stored"
    );
    Ok(Json(snapshot))
}

/// DELETE /snapshots/:id
pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.storage.delete_snapshot(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("snapshot {id}")))
    }
}
