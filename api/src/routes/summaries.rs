//! Completed summaries

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::QueryRejection},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::Pagination;
use super::auth::AuthUser;
use crate::AppState;
use crate::models::QueueItem;
use crate::services::error::{ApiError, LogErr};
use crate::services::queue::SummaryPage;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/summaries", get(list_summaries))
        .route("/summaries/search", get(search_summaries))
        .route("/summaries/{id}", get(get_summary).delete(delete_summary))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

#[derive(Serialize)]
struct SummaryDetail {
    summary: QueueItem,
}

#[derive(Serialize)]
struct DeletedSummary {
    deleted: bool,
    id: Uuid,
}

/// GET /summaries - Newest first; free plans see the last week only
async fn list_summaries(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    page: Result<Query<Pagination>, QueryRejection>,
) -> Result<Json<SummaryPage>, ApiError> {
    let page = Pagination::from_query(page)?;
    let summaries = state
        .queue
        .summaries(user_id, page.limit(), page.offset())
        .await?;
    Ok(Json(summaries))
}

/// GET /summaries/search?q= - Title and summary text match, same history window as the list
async fn search_summaries(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    search: Result<Query<SearchQuery>, QueryRejection>,
    page: Result<Query<Pagination>, QueryRejection>,
) -> Result<Json<SummaryPage>, ApiError> {
    let Query(search) = search.log_status(
        "Invalid search query",
        ApiError::BadRequest("Search query q is required".into()),
    )?;
    let page = Pagination::from_query(page)?;
    let summaries = state
        .queue
        .search_summaries(user_id, search.q.as_deref(), page.limit(), page.offset())
        .await?;
    Ok(Json(summaries))
}

/// GET /summaries/{id}
async fn get_summary(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SummaryDetail>, ApiError> {
    let summary = state.queue.summary(user_id, id).await?;
    Ok(Json(SummaryDetail { summary }))
}

/// DELETE /summaries/{id} - Soft delete; a second delete is a 404
async fn delete_summary(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletedSummary>, ApiError> {
    state.queue.delete_summary(user_id, id).await?;
    Ok(Json(DeletedSummary { deleted: true, id }))
}
