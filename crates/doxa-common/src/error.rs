//! Error types for Doxa
//!
//! Provides the unified error type surfaced across the storage and query
//! core, matching the seven error kinds a caller can observe.

use thiserror::Error;

/// Result type alias using Doxa's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage and query core.
#[derive(Error, Debug)]
pub enum Error {
    /// Addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional put failed its precondition. Internal to the commit
    /// engine's OCC loop; callers normally see `CommitConflict` instead.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// OCC retries were exhausted while attempting a commit.
    #[error("commit conflict: retry budget exceeded after {attempts} attempts on {namespace}")]
    CommitConflict { namespace: String, attempts: u32 },

    /// A range read was out of bounds or the stored bytes were malformed.
    #[error("read error: {0}")]
    ReadError(String),

    /// A filter or update specification failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A decoded row does not match its declared schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The object-store transport is unavailable; may be retried by the
    /// caller.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// IO error that does not fit one of the above categories.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else; should be rare outside of genuinely unexpected states.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the commit engine's caller may reasonably retry
    /// (transient object-store failures).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }

    pub fn commit_conflict(namespace: impl Into<String>, attempts: u32) -> Self {
        Error::CommitConflict {
            namespace: namespace.into(),
            attempts,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
