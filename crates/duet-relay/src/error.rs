//! Relay error type and its wire mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use duet_proto::ErrorBody;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Absent, or not visible to the caller.
    #[error("not found")]
    NotFound,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("internal: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::Store(_) | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire-safe body. Internal causes are logged here and never sent.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            RelayError::NotFound => ErrorBody::new("not_found", "Not found"),
            RelayError::InvalidOperation(reason) => ErrorBody::new("invalid_operation", reason.clone()),
            RelayError::Unauthorized => ErrorBody::new("unauthorized", "Unauthorized"),
            RelayError::Store(_) | RelayError::Internal(_) => {
                error!(error = %self, "request failed");
                ErrorBody::new("internal", "Internal server error")
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_error_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = RelayError::Store(StoreError::Corrupt("row 7 of users".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = err.to_error_body();
        assert_eq!(body.error, "internal");
        assert!(!body.message.contains("row 7"));
    }

    #[test]
    fn status_codes() {
        assert_eq!(RelayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RelayError::InvalidOperation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(RelayError::Unauthorized.to_error_body().error, "unauthorized");
    }
}
