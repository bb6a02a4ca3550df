use axum::{Json, Router, extract::State, routing::get};
use std::sync::Arc;

use super::auth::AuthUser;
use crate::AppState;
use crate::services::error::ApiError;
use crate::services::queue::Usage;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/usage", get(get_usage))
}

/// GET /usage - Today's quota and lifetime time saved
async fn get_usage(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Usage>, ApiError> {
    Ok(Json(state.queue.usage(user_id).await?))
}
