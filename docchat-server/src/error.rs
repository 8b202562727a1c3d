use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use docchat_rag::RagError;
use thiserror::Error;
use tracing::warn;

use crate::protocol::ErrorResponse;

/// Failures of the JSON API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("no trace recorded for turn '{0}'")]
    TraceNotFound(String),

    #[error(transparent)]
    Rag(#[from] RagError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) | Self::TraceNotFound(_) => StatusCode::NOT_FOUND,
            Self::Rag(err) => rag_status(err),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::TraceNotFound(_) => "trace_not_found",
            Self::Rag(err) => match rag_status(err) {
                StatusCode::BAD_REQUEST => "invalid_input",
                StatusCode::SERVICE_UNAVAILABLE => "upstream_unavailable",
                StatusCode::BAD_GATEWAY => "upstream_failed",
                _ => "internal",
            },
        }
    }

    /// Text shown to the user. Upstream detail stays in the logs.
    pub fn message(&self) -> String {
        match self {
            Self::Rag(err) => err.user_message(),
            other => other.to_string(),
        }
    }
}

/// 400 for bad input, 503 for retryable upstream failures, 502 for other
/// upstream failures and 500 for everything else.
pub fn rag_status(err: &RagError) -> StatusCode {
    match err {
        RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        err if err.service_kind().is_some() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, status = status.as_u16(), "request failed");
        }
        let body = ErrorResponse { code: self.code().to_string(), error: self.message() };
        (status, Json(body)).into_response()
    }
}
