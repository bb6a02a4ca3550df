//! Error handling utilities for route handlers

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};

use crate::constants::UPGRADE_URL;
use crate::models::Plan;

/// Errors returned to API clients as `{"error", "code", ...context}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid YouTube URL")]
    InvalidUrl { invalid: Vec<String> },

    #[error("{0}")]
    Duplicate(String),

    #[error("Cannot {action} an item that is {status}")]
    InvalidState { action: &'static str, status: String },

    #[error("Daily limit reached")]
    RateLimited { limit: u32, plan: Plan },

    #[error("{0} requires a Pro plan")]
    ProRequired(&'static str),

    #[error("Not found")]
    NotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            ApiError::Duplicate(_) | ApiError::InvalidState { .. } => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ProRequired(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::InvalidUrl { .. } => "INVALID_URL",
            ApiError::Duplicate(_) => "DUPLICATE",
            ApiError::InvalidState { .. } => "INVALID_STATE",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::ProRequired(_) => "PRO_REQUIRED",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Internal => "INTERNAL",
        }
    }

    fn context(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        match self {
            ApiError::InvalidUrl { invalid } if !invalid.is_empty() => {
                extra.insert("invalid".into(), json!(invalid));
            }
            ApiError::RateLimited { limit, plan } => {
                extra.insert("limit".into(), json!(limit));
                extra.insert("plan".into(), json!(plan.as_str()));
            }
            ApiError::ProRequired(_) => {
                extra.insert("upgradeUrl".into(), json!(UPGRADE_URL));
            }
            _ => {}
        }
        extra
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = self.context();
        body.insert("error".into(), json!(self.to_string()));
        body.insert("code".into(), json!(self.code()));
        (self.status(), Json(Value::Object(body))).into_response()
    }
}

/// Extension trait for logging errors and converting to an API error
pub trait LogErr<T> {
    /// Log error with context and return an internal error
    fn log_500(self, context: &str) -> Result<T, ApiError>;

    /// Log error with context and return a custom error
    fn log_status(self, context: &str, error: ApiError) -> Result<T, ApiError>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, ApiError> {
        self.map_err(|e| {
            tracing::error!(error = %e, "{}", context);
            ApiError::Internal
        })
    }

    fn log_status(self, context: &str, error: ApiError) -> Result<T, ApiError> {
        self.map_err(|e| {
            tracing::warn!(error = %e, "{}", context);
            error
        })
    }
}
