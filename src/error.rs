//! Error types.
//!
//! Two layers:
//!
//! - [`ApiError`] is everything a client can be told about: a rejected
//!   credential, a rate-limit denial, a missing record. Each variant maps to
//!   one status code and serialises as `{"error": "<message>"}`.
//! - [`Error`] surfaces infrastructure failures: binding to a port,
//!   accepting a connection, invalid configuration. Clients never see it.

use http::StatusCode;
use serde::Serialize;

use crate::response::{IntoResponse, Json, Response};

/// Infrastructure error returned by [`Server::serve`](crate::Server::serve)
/// and [`Config::from_env`](crate::Config::from_env).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Every way a request can be turned away.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Too many requests, please try again later")]
    RateLimitExceeded,

    #[error("Authorization header required")]
    MissingCredential,

    #[error("Invalid token")]
    InvalidCredential,

    #[error("Token expired")]
    ExpiredCredential,

    #[error("Account is deactivated")]
    InactiveAccount,

    #[error("Admin access required")]
    InsufficientRole,

    #[error("Origin not allowed")]
    OriginNotAllowed,

    #[error("Route not found")]
    RouteNotFound,

    #[error("Request body too large")]
    PayloadTooLarge,

    /// Wrong credentials on login; distinct from a bad bearer token.
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Opaque failure from a handler or the store. The message is logged,
    /// never sent.
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::MissingCredential
            | Self::InvalidCredential
            | Self::ExpiredCredential
            | Self::InactiveAccount
            | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientRole | Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::RouteNotFound | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(%detail, "internal error");
        }
        let status = self.status();
        let mut res = Json(ErrorBody { error: self.to_string() }).into_response();
        res.set_status(status);
        res
    }
}
