//! Error responses.
//!
//! Domain errors are mapped to a status code and a stable error code; the body
//! is always `{"code": ..., "message": ...}`.

use crate::bids::{BidServiceError, BidStoreError};
use crate::gateway::GatewayError;
use crate::search::SearchError;
use crate::service::ServiceError;
use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: &'static str,
}

impl ApiError {
    /// Create an error.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{resource} with id {id} not found"))
    }

    /// 409 Conflict.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// 408 Request Timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, "TIMEOUT", message)
    }

    /// 503 Service Unavailable.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", message)
    }

    /// Response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, code = self.code, message = %self.message, "Request failed");
        }
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found("Auction", id),
            StoreError::AlreadyExists(_) | StoreError::Conflict(_) => Self::conflict(err.to_string()),
            StoreError::Outbox(_) | StoreError::Storage(_) => Self::unavailable(err.to_string()),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(message) => Self::bad_request(message),
            ServiceError::Store(err) => err.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(id) => Self::not_found("Auction", id),
            GatewayError::Timeout(_) => Self::timeout(err.to_string()),
            GatewayError::Unavailable(_) => Self::unavailable(err.to_string()),
        }
    }
}

impl From<BidServiceError> for ApiError {
    fn from(err: BidServiceError) -> Self {
        match err {
            BidServiceError::Gateway(err) => err.into(),
            BidServiceError::Rejected(err) => Self::bad_request(err.to_string()),
            BidServiceError::Outbox(err) => Self::internal(err.to_string()),
            BidServiceError::Store(err) => err.into(),
        }
    }
}

impl From<BidStoreError> for ApiError {
    fn from(err: BidStoreError) -> Self {
        Self::unavailable(err.to_string())
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        Self::unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::BidError;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn display_includes_code() {
        let err = ApiError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
    }

    #[test]
    fn gateway_errors_map_to_404_and_408() {
        let id = Uuid::nil();
        assert_eq!(ApiError::from(GatewayError::NotFound(id)).status(), StatusCode::NOT_FOUND);
        let timeout = ApiError::from(GatewayError::Timeout(Duration::from_secs(2)));
        assert_eq!(timeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(timeout.code(), "TIMEOUT");
    }

    #[test]
    fn store_and_bid_errors() {
        assert_eq!(ApiError::from(StoreError::Conflict(Uuid::nil())).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(StoreError::Storage("down".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(BidServiceError::Rejected(BidError::OwnAuction)).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
