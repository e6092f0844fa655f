//! Run log API handlers
//!
//! GET /runs/collection, GET /runs/retrain

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::{
    db::{collection_runs, retrain_runs},
    error::{ApiError, ApiResult},
    models::{CollectionRun, RunOutcome},
    AppState,
};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> ApiResult<usize> {
        match self.limit {
            None => Ok(DEFAULT_LIMIT),
            Some(0) => Err(ApiError::BadRequest("limit must be at least 1".to_string())),
            Some(n) => Ok(n.min(MAX_LIMIT)),
        }
    }
}

/// GET /runs/collection
pub async fn list_collection_runs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<CollectionRun>>> {
    let runs = collection_runs::latest_runs(&state.db, query.resolve()?)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(runs))
}

/// GET /runs/retrain
pub async fn list_retrain_runs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<RunOutcome>>> {
    let outcomes = retrain_runs::latest_outcomes(&state.db, query.resolve()?)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(outcomes))
}

/// Build run log routes
pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs/collection", get(list_collection_runs))
        .route("/runs/retrain", get(list_retrain_runs))
}
