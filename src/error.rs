// Caller-facing error taxonomy
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::actor::token::TokenError;
use crate::store::StoreError;

/// Errors surfaced to the caller of any guarded operation.
///
/// Internal storage details never reach the message of a variant; store
/// failures are logged where they are converted and replaced by a generic text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// Token missing, malformed, badly signed or expired
    #[error("{0}")]
    Unauthenticated(String),

    /// Actor proven but not entitled (includes revoked accounts)
    #[error("{0}")]
    Forbidden(String),

    /// Target or required ancestor absent, or masked as absent
    #[error("{0}")]
    NotFound(String),

    /// State or uniqueness violation
    #[error("{0}")]
    Conflict(String),

    /// Malformed input reaching the core
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Internal(String),
}

pub type GuardResult<T> = Result<T, GuardError>;

impl GuardError {
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        GuardError::Unauthenticated(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        GuardError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        GuardError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        GuardError::Conflict(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GuardError::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GuardError::Internal(message.into())
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::Validation(_) => 400,
            GuardError::Unauthenticated(_) => 401,
            GuardError::Forbidden(_) => 403,
            GuardError::NotFound(_) => 404,
            GuardError::Conflict(_) => 409,
            GuardError::Internal(_) => 500,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "VALIDATION_ERROR",
            GuardError::Unauthenticated(_) => "UNAUTHORIZED",
            GuardError::Forbidden(_) => "FORBIDDEN",
            GuardError::NotFound(_) => "NOT_FOUND",
            GuardError::Conflict(_) => "CONFLICT",
            GuardError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            GuardError::Unauthenticated(msg)
            | GuardError::Forbidden(msg)
            | GuardError::NotFound(msg)
            | GuardError::Conflict(msg)
            | GuardError::Validation(msg)
            | GuardError::Internal(msg) => msg,
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        json!({
            "success": false,
            "error": self.message(),
            "code": self.error_code()
        })
    }
}

impl From<StoreError> for GuardError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(constraint) => {
                tracing::warn!("Unique constraint rejected write: {}", constraint);
                GuardError::conflict("A record with the same unique fields already exists")
            }
            StoreError::InvalidIdentifier(name) => {
                tracing::error!("Rejected identifier in store query: {}", name);
                GuardError::internal("An error occurred while processing your request")
            }
            StoreError::Decode(msg) => {
                tracing::error!("Store row decode error: {}", msg);
                GuardError::internal("An error occurred while processing your request")
            }
            StoreError::Unavailable(msg) => {
                tracing::error!("Store unavailable: {}", msg);
                GuardError::internal("An error occurred while processing your request")
            }
            StoreError::Sqlx(sqlx_err) => {
                // Log the real error but return generic message
                tracing::error!("SQLx error: {}", sqlx_err);
                GuardError::internal("Database error occurred")
            }
        }
    }
}

impl From<TokenError> for GuardError {
    fn from(err: TokenError) -> Self {
        tracing::debug!("Token rejected: {}", err);
        match err {
            TokenError::Expired => GuardError::unauthenticated("Token has expired"),
            TokenError::UnknownRole(_) => GuardError::unauthenticated("Token carries an unknown role"),
            TokenError::MissingSecret => GuardError::internal("Token verification is not configured"),
            TokenError::Invalid(_) | TokenError::Generation(_) => {
                GuardError::unauthenticated("Invalid token")
            }
        }
    }
}

// Automatic HTTP response conversion for Axum
impl IntoResponse for GuardError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(GuardError::unauthenticated("x").status_code(), 401);
        assert_eq!(GuardError::forbidden("x").status_code(), 403);
        assert_eq!(GuardError::not_found("x").status_code(), 404);
        assert_eq!(GuardError::conflict("x").status_code(), 409);
        assert_eq!(GuardError::validation("x").status_code(), 400);
        assert_eq!(GuardError::internal("x").status_code(), 500);
    }

    #[test]
    fn store_errors_do_not_leak_details() {
        let err: GuardError = StoreError::Unavailable("connection refused to 10.0.0.4".into()).into();
        assert_eq!(err.status_code(), 500);
        assert!(!err.message().contains("10.0.0.4"));

        let err: GuardError = StoreError::UniqueViolation("uq_waitlist_appointment_patient".into()).into();
        assert!(matches!(err, GuardError::Conflict(_)));
        assert!(!err.message().contains("uq_waitlist"));
    }

    #[test]
    fn json_body_carries_code() {
        let body = GuardError::conflict("already deleted").to_json();
        assert_eq!(body["code"], "CONFLICT");
        assert_eq!(body["error"], "already deleted");
        assert_eq!(body["success"], false);
    }
}
