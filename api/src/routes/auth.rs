//! Request authentication

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::CookieJar;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::services::error::{ApiError, LogErr};
use crate::services::session;

const ACCESS_COOKIE: &str = "access_token";

/// Extractor that validates the access token and returns the user id.
///
/// Accepts `Authorization: Bearer <jwt>` first, then the `access_token` cookie.
pub struct AuthUser(pub Uuid);

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(parts) {
            Some(token) => token,
            None => {
                let jar = CookieJar::from_request_parts(parts, state)
                    .await
                    .log_500("Cookie extraction error")?;
                jar.get(ACCESS_COOKIE)
                    .map(|c| c.value().to_string())
                    .ok_or(ApiError::Unauthorized)?
            }
        };

        let user_id = session::validate_access_token(&token, &state.jwt_secret)
            .log_status("JWT validation failed", ApiError::Unauthorized)?;

        Ok(AuthUser(user_id))
    }
}
