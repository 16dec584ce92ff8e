//! Centralized error types for the Songnest core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::store::StoreError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "store_connect_failed",
            Self::Command(_) => "store_command_failed",
        }
    }
}

impl ErrorCode for CatalogError {
    fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "catalog_rate_limited",
            Self::Http(_) => "catalog_request_failed",
            Self::Status { .. } => "catalog_error_status",
            Self::NotFound(_) => "catalog_not_found",
            Self::Malformed(_) => "catalog_malformed_response",
            Self::Unconfigured => "catalog_unconfigured",
        }
    }
}

/// Application-wide error type for the Songnest core.
#[derive(Debug, Error)]
pub enum SongnestError {
    /// Mutating call arrived while the nest's `DELETING` sentinel is set.
    #[error("Nest is being deleted")]
    NestDeleting,

    /// Add attempted with the queue already at its depth cap.
    #[error("Queue is full ({cap} tracks max)")]
    QueueFull {
        /// The configured depth cap, surfaced in the message.
        cap: u64,
    },

    /// The catalog is rate-limited or unreachable; try again later.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Track, episode, or nest id does not resolve.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid bearer token / session identity.
    #[error("Unauthorized")]
    Unauthorized,

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SongnestError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NestDeleting => "nest_deleting",
            Self::QueueFull { .. } => "queue_full",
            Self::CatalogUnavailable(_) => "catalog_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NestDeleting => StatusCode::CONFLICT,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type SongnestResult<T> = Result<T, SongnestError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for SongnestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, "Bearer".parse().expect("static"));
        }
        response
    }
}

impl From<StoreError> for SongnestError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<CatalogError> for SongnestError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => Self::NotFound(id),
            other => Self::CatalogUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nest_deleting_returns_conflict() {
        let err = SongnestError::NestDeleting;
        assert_eq!(err.code(), "nest_deleting");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn queue_full_carries_cap_in_message() {
        let err = SongnestError::QueueFull { cap: 25 };
        assert!(err.to_string().contains("25"));
        assert_eq!(err.code(), "queue_full");
    }

    #[test]
    fn unauthorized_maps_to_401() {
        assert_eq!(
            SongnestError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn catalog_not_found_converts_to_not_found() {
        let err: SongnestError = CatalogError::NotFound("spotify:track:abc".into()).into();
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn catalog_rate_limit_converts_to_unavailable() {
        let err: SongnestError = CatalogError::RateLimited {
            retry_after_secs: 30,
        }
        .into();
        assert_eq!(err.code(), "catalog_unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
