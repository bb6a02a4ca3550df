//! Queue endpoints

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use uuid::Uuid;

use super::Pagination;
use super::auth::AuthUser;
use crate::AppState;
use crate::models::QueueItem;
use crate::services::error::{ApiError, LogErr};
use crate::services::queue::{BatchEnqueued, EnqueueInput, Enqueued};

pub fn routes() -> Router<Arc<AppState>> {
    // Mutations are throttled per client IP: burst of 20, then 2 per second
    let rate_limit_config = GovernorConfigBuilder::default()
        .per_millisecond(500)
        .burst_size(20)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("Failed to build rate limit config");

    let rate_limit_layer = GovernorLayer {
        config: rate_limit_config.into(),
    };

    let mutations = Router::new()
        .route("/queue", post(enqueue))
        .route("/queue/batch", post(enqueue_batch))
        .route("/queue/{id}/retry", post(retry_item))
        .route("/queue/{id}", axum::routing::delete(delete_item))
        .layer(rate_limit_layer);

    Router::new()
        .route("/queue", get(list_queue))
        .route("/queue/{id}", get(get_item))
        .merge(mutations)
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    videos: Vec<EnqueueInput>,
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: bool,
}

#[derive(Serialize)]
struct QueueList {
    items: Vec<QueueItem>,
}

/// POST /queue - Add a video to the queue
async fn enqueue(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<EnqueueInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let Json(input) = payload.log_status(
        "Invalid enqueue body",
        ApiError::BadRequest("videoUrl is required".into()),
    )?;

    let enqueued = state.queue.enqueue(user_id, input).await?;
    Ok((StatusCode::CREATED, Json(enqueued)))
}

/// POST /queue/batch - Add up to ten videos at once (Pro)
async fn enqueue_batch(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BatchEnqueued>), ApiError> {
    let Json(req) = payload.log_status(
        "Invalid batch body",
        ApiError::BadRequest("videos must be a list of { videoUrl }".into()),
    )?;

    let result = state.queue.enqueue_batch(user_id, req.videos).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /queue - Items not yet completed, newest first
async fn list_queue(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    page: Result<Query<Pagination>, QueryRejection>,
) -> Result<Json<QueueList>, ApiError> {
    let page = Pagination::from_query(page)?;
    let items = state
        .queue
        .list(user_id, page.limit(), page.offset())
        .await?;
    Ok(Json(QueueList { items }))
}

/// GET /queue/{id}
async fn get_item(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueItem>, ApiError> {
    Ok(Json(state.queue.get(user_id, id).await?))
}

/// POST /queue/{id}/retry - Re-run a pending or failed item
async fn retry_item(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueItem>, ApiError> {
    Ok(Json(state.queue.retry(user_id, id).await?))
}

/// DELETE /queue/{id}
async fn delete_item(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.queue.delete(user_id, id).await?;
    Ok(Json(DeletedResponse { deleted: true }))
}
