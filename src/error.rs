//! Error types for the Google Photos sync engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while syncing a directory tree to Google Photos.
#[derive(Error, Debug)]
pub enum SyncError {
    /// HTTP request failed (network error, timeout, etc.)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Invalid URL format
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Access token is missing or malformed
    #[error("Invalid access token")]
    InvalidAccessToken,

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted upload-state file exists but cannot be parsed
    #[error("Upload state file {path:?} is corrupt: {source}")]
    CorruptState {
        /// Location of the offending file
        path: PathBuf,
        /// The underlying parse failure
        #[source]
        source: serde_json::Error,
    },

    /// Consecutive transient failures exceeded the retry budget
    #[error("Retry budget exhausted after {retries} consecutive transient failures: {last}")]
    RetriesExhausted {
        /// How many consecutive retries were attempted
        retries: u32,
        /// Description of the last transient failure
        last: String,
    },

    /// The run was cancelled before completing
    #[error("Run cancelled")]
    Cancelled,

    /// The run exceeded its overall deadline
    #[error("Run exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

/// Coarse classification of a failure, decided once at the API boundary.
///
/// Classification is by status kind, never by message text. The uploader
/// and album manager branch on this, not on concrete error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff: network failures, timeouts, rate
    /// limiting, and server-side hiccups.
    Transient,

    /// The request itself was rejected (HTTP 400 / `INVALID_ARGUMENT`).
    /// Permanent for the item that triggered it.
    InvalidArgument,

    /// Not retriable; surfaces as a run-level failure.
    Fatal,
}

impl SyncError {
    /// Classifies this error per the taxonomy above.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            SyncError::Api { status, .. } => match status {
                400 => ErrorClass::InvalidArgument,
                408 | 429 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            _ => ErrorClass::Fatal,
        }
    }

    /// Shorthand for an `INVALID_ARGUMENT` API rejection.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        SyncError::Api {
            status: 400,
            message: message.into(),
        }
    }

    /// Shorthand for a rate-limited (`RESOURCE_EXHAUSTED`) API response.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        SyncError::Api {
            status: 429,
            message: message.into(),
        }
    }

    /// Best-effort duplicate for reporting the same failure in more
    /// than one place; variants wrapping foreign error types degrade to
    /// their rendered message.
    pub fn duplicate(&self) -> Self {
        match self {
            SyncError::Api { status, message } => SyncError::Api {
                status: *status,
                message: message.clone(),
            },
            SyncError::RetriesExhausted { retries, last } => SyncError::RetriesExhausted {
                retries: *retries,
                last: last.clone(),
            },
            SyncError::Cancelled => SyncError::Cancelled,
            SyncError::DeadlineExceeded(limit) => SyncError::DeadlineExceeded(*limit),
            SyncError::InvalidAccessToken => SyncError::InvalidAccessToken,
            other => SyncError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_status_classification() {
        assert_eq!(
            SyncError::invalid_argument("bad upload token").class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(
            SyncError::resource_exhausted("quota").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SyncError::Api {
                status: 403,
                message: "forbidden".into()
            }
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_non_api_errors_are_fatal() {
        let err = SyncError::Io(std::io::Error::other("disk"));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(SyncError::Cancelled.class(), ErrorClass::Fatal);
    }
}
