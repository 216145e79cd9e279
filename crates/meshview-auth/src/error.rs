//! Error types for authentication and session handling

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::cluster::ClusterError;

/// Result type for authentication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for authentication operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credentials were rejected; always actionable by the user
    #[error("{reason}{}", fmt_detail(.detail))]
    AuthenticationFailure {
        /// Status to answer with (400, 401 or 403)
        status: StatusCode,
        /// Short description shown to the user
        reason: String,
        /// Underlying cause, if any
        detail: Option<String>,
    },

    /// No usable session on the request
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Revoking a token at the provider failed; the session is left in place
    #[error("{message}")]
    TerminateSession {
        /// What went wrong
        message: String,
        /// Status to answer with
        status: StatusCode,
    },

    /// Request is missing required parameters
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Creating a session failed
    #[error("session error: {0}")]
    Session(String),

    /// Cluster API call failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Identity provider call failed
    #[error("provider error: {0}")]
    Provider(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

fn fmt_detail(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl Error {
    /// Authentication failure answered with 401
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Error::AuthenticationFailure {
            status: StatusCode::UNAUTHORIZED,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Authentication failure answered with 403
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Error::AuthenticationFailure {
            status: StatusCode::FORBIDDEN,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Authentication failure with an explicit status and cause
    pub fn auth_failure(
        status: StatusCode,
        reason: impl Into<String>,
        detail: impl std::fmt::Display,
    ) -> Self {
        Error::AuthenticationFailure {
            status,
            reason: reason.into(),
            detail: Some(detail.to_string()),
        }
    }

    /// Whether this is the expected "nobody is logged in" condition
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Error::SessionNotFound(_))
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Error::AuthenticationFailure { status, .. } => *status,
            Error::SessionNotFound(_) => StatusCode::UNAUTHORIZED,
            Error::TerminateSession { status, .. } => *status,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Cluster(ClusterError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            Error::Cluster(ClusterError::Forbidden(_)) => StatusCode::FORBIDDEN,
            Error::Cluster(_) => StatusCode::BAD_GATEWAY,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Error::AuthenticationFailure { reason, detail, .. } => serde_json::json!({
                "error": reason,
                "detail": detail,
            }),
            // Session internals are not echoed back to the browser
            Error::SessionNotFound(_) => serde_json::json!({ "error": "Unauthorized" }),
            other => serde_json::json!({ "error": other.to_string() }),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Provider(e.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Error::unauthorized(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_message_includes_detail() {
        let err = Error::auth_failure(
            StatusCode::FORBIDDEN,
            "the OpenID token was rejected",
            "bad audience",
        );
        assert_eq!(err.to_string(), "the OpenID token was rejected: bad audience");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let err = Error::unauthorized("token is not valid or is expired");
        assert_eq!(err.to_string(), "token is not valid or is expired");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::SessionNotFound("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::Cluster(ClusterError::Unauthorized("x".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::Cluster(ClusterError::Unreachable("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_session_not_found_detection() {
        assert!(Error::SessionNotFound("gone".into()).is_session_not_found());
        assert!(!Error::unauthorized("nope").is_session_not_found());
    }

    #[test]
    fn test_authentication_failure_is_never_server_error() {
        let err = Error::unauthorized("x");
        assert!(err.status().is_client_error());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
