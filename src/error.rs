//! Crate-wide error taxonomy and its wire representation.
//!
//! Every failure a client can observe maps to one of the stable codes below.
//! No variant carries an internal cause string onto the wire; `message` is
//! always a short, safe, human-readable sentence.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("the message was not valid JSON")]
    InvalidJson,
    #[error("unrecognized envelope type")]
    UnknownType,
    #[error("the payload did not match the expected shape")]
    InvalidPayload,
    #[error("authentication is required for this operation")]
    Unauthorized,
    #[error("the token is invalid")]
    InvalidToken,
    #[error("the token has expired")]
    TokenExpired,
    #[error("the token has been revoked")]
    TokenRevoked,
    #[error("no such user")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("too many requests")]
    RateLimited { retry_after_ms: u64 },
    #[error("account locked")]
    AccountLocked { retry_after_ms: u64 },
    #[error("no such session")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("origin is not allowed")]
    ForbiddenOrigin,
    #[error("csrf token missing or invalid")]
    CsrfInvalid,
    #[error("content rejected for containing a script payload")]
    XssDetected,
    #[error("content rejected as a suspected SQL injection")]
    SqliSuspicious,
    #[error("path traversal detected")]
    PathTraversal,
    #[error("server is applying backpressure")]
    Backpressure,
    #[error("internal error")]
    InternalError,
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidJson => "invalid_json",
            HubError::UnknownType => "unknown_type",
            HubError::InvalidPayload => "invalid_payload",
            HubError::Unauthorized => "unauthorized",
            HubError::InvalidToken => "invalid_token",
            HubError::TokenExpired => "token_expired",
            HubError::TokenRevoked => "token_revoked",
            HubError::UserNotFound => "user_not_found",
            HubError::InvalidCredentials => "invalid_credentials",
            HubError::RateLimited { .. } => "rate_limited",
            HubError::AccountLocked { .. } => "account_locked",
            HubError::SessionNotFound => "session_not_found",
            HubError::SessionExpired => "session_expired",
            HubError::ForbiddenOrigin => "forbidden_origin",
            HubError::CsrfInvalid => "csrf_invalid",
            HubError::XssDetected => "xss_detected",
            HubError::SqliSuspicious => "sqli_suspicious",
            HubError::PathTraversal => "path_traversal",
            HubError::Backpressure => "backpressure",
            HubError::InternalError => "internal_error",
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            HubError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            HubError::AccountLocked { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Build the outbound `error` envelope payload for this failure.
    pub fn to_envelope(&self, r#ref: Option<String>) -> ErrorEnvelope {
        ErrorEnvelope {
            r#type: "error",
            payload: ErrorPayload {
                code: self.code(),
                message: self.to_string(),
                retry_after_ms: self.retry_after_ms(),
            },
            r#ref: r#ref,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub r#type: &'static str,
    pub payload: ErrorPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}
