//! Error types for the authority HTTP layer.
//!
//! [`AuthorityError`] converts into an Axum response with a JSON body
//! `{"error": ..., "status": ...}`.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use linkjam_core::validation::BoundsError;

/// Errors returned by the REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    /// The requested room does not exist.
    #[error("room not found: {0}")]
    NotFound(String),

    /// A field was outside its allowed range.
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    /// The request body could not be decoded.
    #[error("invalid request body: {0}")]
    BadBody(String),
}

impl From<JsonRejection> for AuthorityError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadBody(rejection.body_text())
    }
}

impl IntoResponse for AuthorityError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Bounds(_) | Self::BadBody(_) => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
