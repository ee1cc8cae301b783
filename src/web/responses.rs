//! HTTP response types and error mapping
//!
//! Standardized response envelope for all endpoints, plus the mapping from
//! application errors to HTTP status codes. Capacity rejections carry a
//! `Retry-After` header so well-behaved players back off instead of
//! hammering the admission endpoint.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{AdmissionError, AppError, RegistryError};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Whether the operation was successful
    pub success: bool,
    /// Response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds after which the client may retry (capacity rejections)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Request timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            retry_after: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an error response
    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            retry_after: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self {
            AppError::Admission(AdmissionError::CapacityExhausted { retry_after, .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, Some(retry_after.as_secs()))
            }
            AppError::Admission(AdmissionError::SessionFailed { .. }) => {
                (StatusCode::BAD_GATEWAY, None)
            }
            AppError::NotFound { .. }
            | AppError::Registry(RegistryError::SessionNotFound { .. }) => {
                (StatusCode::NOT_FOUND, None)
            }
            AppError::Validation { .. } | AppError::Profile(_) => (StatusCode::BAD_REQUEST, None),
            AppError::Launch(_) => (StatusCode::BAD_GATEWAY, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = ApiResponse {
            retry_after,
            ..ApiResponse::<()>::error(self.to_string())
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after
            && let Ok(value) = header::HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_rejection_maps_to_429_with_header() {
        let error = AppError::Admission(AdmissionError::CapacityExhausted {
            provider_id: "p1".to_string(),
            current: 2,
            max: 2,
            retry_after: Duration::from_secs(30),
        });
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &header::HeaderValue::from_static("30")
        );
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = AppError::not_found("session", "ghost").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_permanently_failed_session_maps_to_502() {
        let error = AppError::Admission(AdmissionError::SessionFailed {
            session_key: "s1".to_string(),
        });
        assert_eq!(error.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
