//! Admin routes: manual retry, historical backfill, pending listing.

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::RecordingDbModel;
use crate::pipeline::retry_engine::{RetryRequest, RetryResult};
use crate::pipeline::sync::{SyncRequest, SyncSummary};

/// Create the admin router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/recordings/retry", post(retry_recordings))
        .route("/recordings/pending", get(pending_recordings))
        .route("/sync/recordings", post(sync_recordings))
}

/// POST /admin/recordings/retry
async fn retry_recordings(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<Json<Vec<RetryResult>>> {
    let engine = state
        .retry_engine
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Retry engine not available"))?;

    let results = engine.run(&request).await.map_err(ApiError::from)?;
    Ok(Json(results))
}

/// POST /admin/sync/recordings
async fn sync_recordings(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<SyncSummary>> {
    let engine = state
        .sync_engine
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Sync engine not available"))?;

    let summary = engine.run(&request).await.map_err(ApiError::from)?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingParams {
    #[serde(default)]
    only_without_artifact: bool,
    limit: Option<i64>,
}

/// GET /admin/recordings/pending
async fn pending_recordings(
    State(state): State<AppState>,
    Query(params): Query<PendingParams>,
) -> ApiResult<Json<Vec<RecordingDbModel>>> {
    let recordings = state
        .recordings
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Repository not available"))?;

    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let rows = recordings
        .list_pending(params.only_without_artifact, limit)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_params_parse() {
        let params: PendingParams =
            serde_urlencoded::from_str("onlyWithoutArtifact=true&limit=10").unwrap();
        assert!(params.only_without_artifact);
        assert_eq!(params.limit, Some(10));

        let params: PendingParams = serde_urlencoded::from_str("").unwrap();
        assert!(!params.only_without_artifact);
        assert!(params.limit.is_none());
    }
}
