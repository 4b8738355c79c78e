//! Error types for cmig-migrate
//!
//! `MigrationError` is the orchestrator taxonomy. `ApiError` maps it onto HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::connectors::ConnectorError;

/// Orchestrator error taxonomy
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Caller lacks permission; run untouched
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Run missing or owned by another clinic; run untouched
    #[error("Not found: {0}")]
    NotFound(String),

    /// Run is not in a compatible status; run untouched
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Connector login/navigation/network failure after retries
    #[error("Vendor connection error: {0}")]
    VendorConnection(String),

    /// Mapping or staged data cannot be applied; the phase fails recoverably
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Unexpected fault
    #[error("System error: {0}")]
    System(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Common error: {0}")]
    Common(#[from] cmig_common::Error),
}

/// Result type for orchestrator operations
pub type MigrationResult<T> = Result<T, MigrationError>;

impl MigrationError {
    /// Failures the phase table treats as recoverable (vendor or mapping trouble)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MigrationError::VendorConnection(_) | MigrationError::Mapping(_)
        )
    }

    /// Local rejections that must leave the run untouched
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MigrationError::Authorization(_)
                | MigrationError::NotFound(_)
                | MigrationError::Precondition(_)
        )
    }

    /// Message safe to persist in `errorMessage` and return to callers
    pub fn sanitized(&self) -> String {
        match self.internal_reason() {
            Some(reason) => MigrationError::System(reason.to_string()).to_string(),
            None => self.to_string(),
        }
    }

    /// Collapse everything that is not part of the taxonomy into `System`
    pub fn into_system(self) -> MigrationError {
        match self.internal_reason() {
            Some(reason) => MigrationError::System(reason.to_string()),
            None => self,
        }
    }

    fn internal_reason(&self) -> Option<&'static str> {
        match self {
            MigrationError::Database(_) => Some("database operation failed"),
            MigrationError::Common(cmig_common::Error::Io(_)) => Some("storage operation failed"),
            MigrationError::Common(_) => Some("internal failure"),
            _ => None,
        }
    }
}

impl From<ConnectorError> for MigrationError {
    fn from(err: ConnectorError) -> Self {
        MigrationError::VendorConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::System(format!("serialization failed: {}", err))
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Migration(err) => {
                let (status, code) = match err {
                    MigrationError::Authorization(_) => (StatusCode::FORBIDDEN, "AUTHORIZATION"),
                    MigrationError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    MigrationError::Precondition(_) => (StatusCode::CONFLICT, "PRECONDITION"),
                    MigrationError::VendorConnection(_) => {
                        (StatusCode::BAD_GATEWAY, "VENDOR_CONNECTION")
                    }
                    MigrationError::Mapping(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "MAPPING")
                    }
                    MigrationError::System(_)
                    | MigrationError::Database(_)
                    | MigrationError::Common(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "SYSTEM")
                    }
                };
                (status, code, err.sanitized())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_is_sanitized() {
        let err = MigrationError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.sanitized(), "System error: database operation failed");
        assert!(matches!(err.into_system(), MigrationError::System(_)));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(MigrationError::VendorConnection("timeout".into()).is_recoverable());
        assert!(MigrationError::Mapping("bad field".into()).is_recoverable());
        assert!(!MigrationError::System("boom".into()).is_recoverable());
        assert!(MigrationError::Precondition("x".into()).is_rejection());
    }

    #[test]
    fn test_precondition_maps_to_conflict() {
        let response =
            ApiError::from(MigrationError::Precondition("already approved".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
