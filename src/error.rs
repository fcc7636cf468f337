//! Crate-level error type returned by handlers and middleware.
//!
//! Errors travel up the middleware chain as ordinary `Err` values. Only the
//! dispatch entry point in [`App`](crate::App) turns a surfaced error into a
//! wire response, through the installed [`ErrorHandler`](crate::app::ErrorHandler).

use std::fmt;

use thiserror::Error;

use crate::http::StatusCode;
use crate::router::RouteError;
use crate::session::SessionError;

/// Shorthand used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a handler or middleware can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// A handler or middleware deliberately ending the request with a status.
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("render failed: {0}")]
    Render(String),

    /// Headers or status were written after the response was committed.
    #[error("response already committed")]
    Committed,

    /// The transport engine lacks the requested capability.
    #[error("{0} is not supported by this engine")]
    NotSupported(&'static str),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps any foreign error.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }

    /// The structured HTTP error carried by this error, if any.
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

/// An error that knows which status it should produce.
///
/// ```
/// use webx::{HttpError, http::StatusCode};
///
/// let err = HttpError::new(StatusCode::NotFound);
/// assert_eq!(err.to_string(), "Not Found");
/// let err = HttpError::new(StatusCode::Forbidden).with_message("admins only");
/// assert_eq!(err.message(), "admins only");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    code: StatusCode,
    message: String,
}

impl HttpError {
    /// An error whose message is the status title.
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: code.canonical_reason().to_owned(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

impl From<StatusCode> for Error {
    fn from(code: StatusCode) -> Self {
        Self::Http(HttpError::new(code))
    }
}
