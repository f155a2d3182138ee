use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::AdmissionError;

pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";
pub const RATE_LIMIT_RETRY_AFTER_SECONDS: &str = "x-rate-limit-retry-after-seconds";
pub const RATE_LIMIT_LIMIT: &str = "x-rate-limit-limit";
pub const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";

/// Body of a 429 denial. Field order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitExceeded {
    pub error: &'static str,
    pub message: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

impl RateLimitExceeded {
    pub fn new(retry_after: u64) -> Self {
        Self {
            error: "Rate limit exceeded",
            message: format!("Too many requests. Please try again in {} seconds.", retry_after),
            retry_after,
        }
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let body = match serde_json::to_vec(&self) {
            Ok(bytes) => Body::from(bytes),
            Err(e) => {
                let err = AdmissionError::DownstreamIo(e.to_string());
                error!(target: "postnow_admission::response", error = %err, "Failed to encode denial body");
                Body::empty()
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        headers.insert(RATE_LIMIT_RETRY_AFTER_SECONDS, HeaderValue::from(self.retry_after));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Generic JSON error body used by the host routes.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self)).into_response()
    }
}
