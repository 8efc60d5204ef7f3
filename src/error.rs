//! Error types for the recovery cache.
//!
//! Fetch-level failures are split into transient and rejected so the
//! reconciler can decide whether to fall back to cached rows. Everything the
//! cache cannot hide from the user surfaces as a [`SyncError`].

use thiserror::Error;

/// Result type alias for cache operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Outcome classification of a single request against the back-office API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Abort or unreachable server: no answer came back. Callers fall back
    /// to cached data.
    #[error("{0}")]
    Transient(String),

    /// The server answered, reporting a temporary condition (busy, query
    /// timeout, 503). Transient as well.
    #[error("{0}")]
    Unavailable(String),

    /// The request outlived its deadline. Transient as well.
    #[error("{0}")]
    TimedOut(String),

    /// Malformed envelope or an explicit non-ok answer that is not transient.
    #[error("{0}")]
    Rejected(String),
}

impl FetchError {
    /// Classify a failure message the server sent back by its text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if crate::api::is_transient_error(&message) {
            FetchError::Unavailable(message)
        } else {
            FetchError::Rejected(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transient(_) | FetchError::Unavailable(_) | FetchError::TimedOut(_)
        )
    }

    pub fn message(&self) -> &str {
        match self {
            FetchError::Transient(m)
            | FetchError::Unavailable(m)
            | FetchError::TimedOut(m)
            | FetchError::Rejected(m) => m,
        }
    }
}

/// Errors surfaced to the page layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(m) | FetchError::Unavailable(m) | FetchError::TimedOut(m) => {
                SyncError::Transient(m)
            }
            FetchError::Rejected(m) => SyncError::Rejected(m),
        }
    }
}
