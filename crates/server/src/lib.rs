//! ASR server
//!
//! HTTP and WebSocket endpoints around the streaming recognition pipeline:
//! `/ws` for full-duplex streaming, `POST /recognize` for one-shot uploads,
//! plus `/health` and `/metrics`.

pub mod http;
pub mod metrics;
pub mod state;
pub mod ws;

pub use http::create_router;
pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Request-level server errors, rendered as `{"detail": ...}` bodies.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server at capacity, try again later")]
    Capacity,

    #[error("{0}")]
    InvalidAudio(String),

    #[error("File too large")]
    TooLarge,

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::InvalidAudio(_) => StatusCode::BAD_REQUEST,
            ServerError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label value for the error counter.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Capacity => "capacity_exceeded",
            ServerError::InvalidAudio(_) => "invalid_audio",
            ServerError::TooLarge => "file_too_large",
            ServerError::BadRequest(_) => "empty_file",
            ServerError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (self.status(), body).into_response()
    }
}
