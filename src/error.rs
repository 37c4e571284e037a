//! Error taxonomy of the intake path and its mapping onto HTTP.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::downstream::DownstreamError;

/// Structural problems with the request body.  Each maps to a distinct
/// rejection and a distinct security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("content type must be application/json")]
    UnsupportedMediaType,
    #[error("request body is not valid JSON")]
    MalformedJson,
    #[error("message is missing or empty")]
    EmptyMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("payload too large (observed {observed:?}, limit {limit} bytes)")]
    PayloadTooLarge { observed: Option<u64>, limit: usize },
    #[error("service misconfigured: {0}")]
    Configuration(&'static str),
    #[error("downstream model call failed: {0}")]
    Downstream(#[from] DownstreamError),
}

impl IntakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(ValidationError::UnsupportedMediaType) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Configuration(_) | Self::Downstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable reason returned to the caller.  Server-side
    /// failures collapse to one generic value so no internal detail leaks.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::UnsupportedMediaType) => "unsupported_media_type",
            Self::Validation(ValidationError::MalformedJson) => "malformed_json",
            Self::Validation(ValidationError::EmptyMessage) => "empty_message",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Configuration(_) | Self::Downstream(_) => "service_unavailable",
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: &'static str,
}

impl ErrorBody {
    pub fn internal() -> Self {
        Self {
            ok: false,
            error: "internal_error",
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            ok: false,
            error: self.reason(),
        };
        (self.status(), Json(body)).into_response()
    }
}
