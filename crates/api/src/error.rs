//! Authentication errors and their HTTP rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth::scope::ScopeError;
use crate::auth::two_factor::TwoFactorError;
use crate::users::StoreError;

const CREDENTIALS_MISMATCH: &str = "These credentials do not match our records.";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Caller input that can be corrected, tied to a request field
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    /// Wrong credentials, or a missing, garbled or expired token
    #[error("{}", CREDENTIALS_MISMATCH)]
    AuthenticationFailed,
    #[error(transparent)]
    ScopeConflict(#[from] ScopeError),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Token issuance failed")]
    TokenIssuanceFailed,
    #[error("Invalid secret length: {0}")]
    InvalidLength(usize),
    #[error("The code is invalid.")]
    InvalidCode,
    #[error("Two factor authentication is not enabled for this user.")]
    NotEnabled,
    #[error("Insufficient permissions")]
    InsufficientScope,
    #[error("Already authenticated")]
    AlreadyAuthenticated,
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        AuthError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation { .. } | AuthError::InvalidCode => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AuthError::AuthenticationFailed | AuthError::TokenIssuanceFailed => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::NotEnabled | AuthError::InsufficientScope | AuthError::AlreadyAuthenticated => {
                StatusCode::FORBIDDEN
            }
            AuthError::ScopeConflict(_)
            | AuthError::KeyNotFound(_)
            | AuthError::InvalidLength(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TwoFactorError> for AuthError {
    fn from(err: TwoFactorError) -> Self {
        match err {
            TwoFactorError::InvalidLength(length) => AuthError::InvalidLength(length),
            TwoFactorError::NotEnabled => AuthError::NotEnabled,
            other => AuthError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Internal(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AuthError::Validation { field, message } => {
                let mut errors = serde_json::Map::new();
                errors.insert((*field).to_string(), json!([message]));
                json!({
                    "error": message,
                    "code": status.as_u16(),
                    "errors": errors
                })
            }
            AuthError::InvalidCode => json!({
                "error": self.to_string(),
                "code": status.as_u16(),
                "errors": { "code": [self.to_string()] }
            }),
            AuthError::AuthenticationFailed | AuthError::TokenIssuanceFailed => json!({
                "error": CREDENTIALS_MISMATCH,
                "code": status.as_u16()
            }),
            AuthError::NotEnabled | AuthError::InsufficientScope | AuthError::AlreadyAuthenticated => {
                json!({
                    "error": self.to_string(),
                    "code": status.as_u16()
                })
            }
            AuthError::ScopeConflict(_)
            | AuthError::KeyNotFound(_)
            | AuthError::InvalidLength(_)
            | AuthError::Internal(_) => {
                tracing::error!(error = %self, "request failed with server error");
                json!({
                    "error": "Internal server error",
                    "code": status.as_u16()
                })
            }
        };

        (status, Json(body)).into_response()
    }
}
