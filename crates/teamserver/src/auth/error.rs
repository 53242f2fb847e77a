//! Authentication errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::error::StorageError;

/// Authentication errors.
///
/// Credential failures share one variant so the rendered message is the same
/// whether or not the username exists.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user, wrong password, SSO-only account, or SSO token mismatch.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Session token does not exist (never issued, revoked, or swept).
    #[error("session not found")]
    SessionNotFound,

    /// Session token exists but is past its expiry.
    #[error("session expired")]
    SessionExpired,

    /// Persistence failure.
    #[error("storage error")]
    Storage(#[from] StorageError),

    /// Internal error (hashing worker failed, etc).
    #[error("internal auth error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::SessionExpired => "session_expired",
            AuthError::Storage(_) => "storage_error",
            AuthError::Internal(_) => "internal_error",
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::InvalidCredentials
            | AuthError::SessionNotFound
            | AuthError::SessionExpired => StatusCode::UNAUTHORIZED,
            AuthError::Storage(_) | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, "authentication failed internally");
        }

        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });

        (status, body).into_response()
    }
}
