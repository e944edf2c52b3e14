use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::engine::types::{WorkflowFilter, WorkflowState, WorkflowStatus};
use crate::storage::WorkflowStore;

use super::AppState;
use super::errors::AppError;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Summary row returned by the list endpoint.
#[derive(Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub events: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// --- Handlers ---

/// PUT /{collection}/{id}
pub async fn put_state(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<WorkflowState>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;
    check_collection(&state, &collection)?;
    if body.workflow_id != id {
        return Err(AppError::BadRequest(format!(
            "Path id '{}' does not match body workflow_id '{}'",
            id, body.workflow_id
        )));
    }

    state.store.save(&body).await?;
    debug!(workflow_id = %id, status = %body.status, events = body.history.len(), "Stored workflow state");

    Ok(Json(json!({
        "saved": id,
        "status": body.status,
    })))
}

/// GET /{collection}/{id}
pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<WorkflowState>, AppError> {
    authorize(&state, &headers)?;
    check_collection(&state, &collection)?;

    state
        .store
        .load(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Workflow '{}' not found", id)))
}

/// DELETE /{collection}/{id}
pub async fn delete_state(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;
    check_collection(&state, &collection)?;

    state.store.delete(&id).await?;
    info!(workflow_id = %id, "Deleted workflow state");

    Ok(Json(json!({
        "deleted": id,
    })))
}

/// GET /{collection}
pub async fn list_states(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;
    check_collection(&state, &collection)?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<WorkflowStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let filter = WorkflowFilter {
        status,
        limit: query.limit,
    };

    let workflows: Vec<WorkflowSummary> = state
        .store
        .list(&filter)
        .await?
        .into_iter()
        .map(|s| WorkflowSummary {
            events: s.history.len(),
            workflow_id: s.workflow_id,
            workflow_type: s.workflow_type,
            status: s.status,
            updated_at: s.updated_at,
        })
        .collect();

    let total = workflows.len();
    Ok(Json(json!({
        "workflows": workflows,
        "total": total,
    })))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.auth_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

fn check_collection(state: &AppState, collection: &str) -> Result<(), AppError> {
    if collection != state.collection {
        return Err(AppError::NotFound(format!(
            "Collection '{}' not found",
            collection
        )));
    }
    Ok(())
}
