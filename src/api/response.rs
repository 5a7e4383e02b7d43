use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Envelope for every successful or partially successful reply
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// The engine ran but the upstream API let it down; `data` says how far it got
    pub fn upstream_failure(data: T, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = match self.success {
            true => StatusCode::OK,
            false => StatusCode::BAD_GATEWAY,
        };
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let response = ApiResponse::success(vec![1, 2]);
        assert!(response.success);
        assert_eq!(response.data, vec![1, 2]);
        assert!(response.error.is_none());
    }

    #[test]
    fn test_upstream_failure_is_bad_gateway() {
        let response = ApiResponse::upstream_failure(3, "2 site(s) failed");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("2 site(s) failed"));
        assert_eq!(response.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
