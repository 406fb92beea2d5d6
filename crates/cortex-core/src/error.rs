//! Error types for cortex.

use std::time::Duration;

use thiserror::Error;

use crate::models::SubmissionFailure;

/// Result type alias using cortex's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cortex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection could not be established or dropped mid-flight
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status (other than throttling)
    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Server throttled the request (HTTP 429)
    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// A non-terminal job (or an in-flight submission) already exists for the target.
    /// Raised locally, before any network call.
    #[error("Job already active for target {target}")]
    JobAlreadyActive {
        target: String,
        job_id: Option<String>,
    },

    /// Every branch of a composite submission failed
    #[error("All {} job submissions failed", .0.len())]
    AllSubmissionsFailed(Vec<SubmissionFailure>),

    /// Operation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Key-value store could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status carried by a server-side rejection, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Server { status, .. } => Some(*status),
            Error::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether the server throttled the request.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// Retry-after hint from a throttled response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether a caller could reasonably retry. Advisory only: nothing in
    /// cortex retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::RateLimited { .. } => true,
            Error::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether this is the local duplicate-submission guard (as opposed to a
    /// duplicate rejected by the server).
    pub fn is_duplicate_guard(&self) -> bool {
        matches!(self, Error::JobAlreadyActive { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Error::Server {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Error::Transport(e.to_string()),
        }
    }
}
