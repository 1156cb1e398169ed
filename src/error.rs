//! Error types.
//!
//! Three families, three lifetimes:
//!
//! - [`HttpError`] travels through a request: route resolution produces it,
//!   handlers pass it to [`Next::fail`](crate::Next::fail), and the response
//!   serializes it with the status code it declares.
//! - [`ConfigError`] is raised while the server is being assembled (bad route
//!   spec, unknown media type, route conflict). It never occurs at request time.
//! - [`Error`] is what [`Server::serve`](crate::Server::serve) returns:
//!   binding, accepting, or a configuration problem discovered at startup.

use std::borrow::Cow;
use std::fmt;

use http::StatusCode;
use serde_json::json;
use thiserror::Error;

// ── HttpError ────────────────────────────────────────────────────────────────

/// Classification of an [`HttpError`].
///
/// The first four are produced by route resolution and map one-to-one onto
/// the overridable [`Outcome`](crate::Outcome)s.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    NotFound,
    MethodNotAllowed,
    InvalidVersion,
    UnsupportedMediaType,
    Internal,
    Other,
}

/// An error that terminates a chain and is delivered to the client.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}")]
pub struct HttpError {
    kind: ErrorKind,
    status: StatusCode,
    code: Cow<'static, str>,
    message: String,
}

impl HttpError {
    /// An error with an arbitrary status. The code is derived from the
    /// status' canonical reason (`422` becomes `"UnprocessableEntity"`).
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let code = status
            .canonical_reason()
            .map(|r| r.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>())
            .unwrap_or_else(|| "Error".to_owned());
        Self { kind: ErrorKind::Other, status, code: Cow::Owned(code), message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::NotFound, StatusCode::NOT_FOUND, "NotFound", message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::with_kind(
            ErrorKind::MethodNotAllowed,
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            message,
        )
    }

    pub fn invalid_version(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::InvalidVersion, StatusCode::BAD_REQUEST, "InvalidVersion", message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::with_kind(
            ErrorKind::UnsupportedMediaType,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UnsupportedMediaType",
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR, "Internal", message)
    }

    /// What the client sees for a panic. The payload itself is only logged.
    pub(crate) fn fault() -> Self {
        Self::internal("internal error")
    }

    fn with_kind(
        kind: ErrorKind,
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self { kind, status, code: Cow::Borrowed(code), message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind { self.kind }
    pub fn status(&self) -> StatusCode { self.status }
    pub fn code(&self) -> &str { &self.code }
    pub fn message(&self) -> &str { &self.message }

    /// The wire representation handed to the formatters.
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl From<std::io::Error> for HttpError {
    fn from(e: std::io::Error) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

// ── ConfigError ──────────────────────────────────────────────────────────────

/// A setup-time failure. Returned by mount, formatter registration and
/// configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid method `{0}`")]
    InvalidMethod(String),

    #[error("invalid path `{0}`: must start with `/`")]
    InvalidPath(String),

    #[error("route `{0}` has no handlers")]
    EmptyChain(String),

    #[error("route `{name}` rejected by router: {reason}")]
    RouteConflict { name: String, reason: String },

    #[error("unknown media type `{0}`")]
    UnknownMediaType(String),

    #[error("invalid weight in `{0}`")]
    InvalidWeight(String),

    #[error("invalid socket address `{0}`")]
    InvalidAddress(String),

    #[error("config: {0}")]
    Toml(#[from] toml::de::Error),
}

// ── Error ────────────────────────────────────────────────────────────────────

/// The error type returned by [`Server::serve`](crate::Server::serve).
///
/// Application-level failures never surface here; they are [`HttpError`]s
/// delivered through the response.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_code_from_status() {
        let err = HttpError::new(StatusCode::UNPROCESSABLE_ENTITY, "bad field");
        assert_eq!(err.code(), "UnprocessableEntity");
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.to_string(), "UnprocessableEntity: bad field");
    }

    #[test]
    fn resolution_errors_carry_their_status() {
        assert_eq!(HttpError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(HttpError::method_not_allowed("x").status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(HttpError::invalid_version("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            HttpError::unsupported_media_type("x").status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn json_body() {
        let body = HttpError::not_found("/nope does not exist").to_json();
        assert_eq!(body["code"], "NotFound");
        assert_eq!(body["message"], "/nope does not exist");
    }
}
