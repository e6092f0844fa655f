//! Deployed model API handlers
//!
//! GET /model/current, GET /model/versions, GET /model/backups,
//! POST /model/rollback

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult, PipelineResult},
    models::{BackupRecord, ModelRecord},
    store::ArtifactStore,
    AppState,
};

/// GET /model/versions entry
#[derive(Debug, Serialize)]
pub struct VersionEntry {
    #[serde(flatten)]
    pub record: ModelRecord,
    pub is_current: bool,
    pub readable: bool,
}

/// POST /model/rollback request
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackRequest {
    /// Target version; the latest backup's superseded version when absent
    #[serde(default)]
    pub version_id: Option<u64>,
}

/// POST /model/rollback response
#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub status: String,
    pub current: ModelRecord,
}

/// Run a store read on the blocking pool
///
/// Reads touch the filesystem and hash whole artifacts.
pub(crate) async fn read_store<T, F>(state: &AppState, read: F) -> ApiResult<T>
where
    F: FnOnce(&ArtifactStore) -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = state.orchestrator.store().clone();
    tokio::task::spawn_blocking(move || read(&store))
        .await
        .map_err(|e| ApiError::Internal(format!("Task join error: {}", e)))?
        .map_err(ApiError::from)
}

/// GET /model/current
pub async fn get_current_model(State(state): State<AppState>) -> ApiResult<Json<ModelRecord>> {
    read_store(&state, |store| store.current())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no model deployed".to_string()))
}

/// GET /model/versions
pub async fn list_versions(State(state): State<AppState>) -> ApiResult<Json<Vec<VersionEntry>>> {
    let versions: Vec<VersionEntry> = read_store(&state, |store| {
        let current = store.current_pointer()?.map(|p| p.version_id);
        Ok(store
            .history()?
            .into_iter()
            .map(|record| VersionEntry {
                is_current: Some(record.version_id) == current,
                readable: store.is_readable(&record),
                record,
            })
            .collect())
    })
    .await?;

    Ok(Json(versions))
}

/// GET /model/backups
pub async fn list_backups(State(state): State<AppState>) -> ApiResult<Json<Vec<BackupRecord>>> {
    Ok(Json(read_store(&state, |store| store.backups()).await?))
}

/// POST /model/rollback
///
/// An empty body rolls back to the latest backup. Any other body must be a
/// well-formed JSON `RollbackRequest`, so a mistyped target never falls
/// through to the default.
pub async fn rollback_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<RollbackResponse>> {
    let request = parse_rollback_request(&headers, &body)?;
    tracing::info!(version_id = ?request.version_id, "Rollback requested via API");

    let current = state.orchestrator.rollback(request.version_id).await?;

    Ok(Json(RollbackResponse {
        status: "rolled_back".to_string(),
        current,
    }))
}

fn parse_rollback_request(headers: &HeaderMap, body: &[u8]) -> ApiResult<RollbackRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RollbackRequest::default());
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("application/json"));
    if !is_json {
        return Err(ApiError::BadRequest(
            "rollback body must be sent as application/json".to_string(),
        ));
    }

    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid rollback request: {}", e)))
}

/// Build model routes
pub fn model_routes() -> Router<AppState> {
    Router::new()
        .route("/model/current", get(get_current_model))
        .route("/model/versions", get(list_versions))
        .route("/model/backups", get(list_backups))
        .route("/model/rollback", post(rollback_model))
}
