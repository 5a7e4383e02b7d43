use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;
use crate::forecast::ValidationError;

/// Failures a handler reports to the caller
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown site: {0}")]
    UnknownSite(String),

    #[error(transparent)]
    Rejected(ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownSite(_) => StatusCode::NOT_FOUND,
            Self::Rejected(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnknownSite(_) => "unknown_site",
            Self::Rejected(_) => "invalid_input",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if let Self::Internal(detail) = &self {
            tracing::error!(%detail, "request failed");
            "the forecast engine hit an internal error".to_string()
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
            self.to_string()
        };

        (status, Json(ErrorBody { error: self.code(), message })).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::UnknownSite(site) => Self::UnknownSite(site),
            other => Self::Rejected(other),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Invalid(e) => e.into(),
            EngineError::Internal(e) => Self::Internal(format!("{e:#}")),
        }
    }
}
