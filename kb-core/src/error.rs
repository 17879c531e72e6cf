//! Error taxonomy shared by every component (path, graph, job queue, stream, RPC fabric).

use thiserror::Error;

/// The one error type every fallible `kb-core` operation returns.
///
/// Variants correspond to the kinds in the error-handling design, not to backend
/// exception types — a Postgres unique-violation and an in-memory duplicate-key
/// check both surface as [`KbError::Conflict`].
#[derive(Debug, Error)]
pub enum KbError {
    /// Malformed path, bad enum value, wrong argument type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No matching node / kb / mount / path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique violation, duplicate link name, or multiple nodes matched where one
    /// was expected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Pre-allocated slot pool exhausted (push found no free/empty slot).
    #[error("no slot available for {0}")]
    NoSlot(String),

    /// Serialization failure, deadlock, or lock-not-available survived past
    /// `max_retries`.
    #[error("lock exhausted after {retries} attempt(s) on {target}")]
    LockExhausted { target: String, retries: u32 },

    /// Connection lost, constraint error, or any other backend failure not
    /// otherwise classified.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] anyhow::Error),
}

impl KbError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn no_slot(path: impl Into<String>) -> Self {
        Self::NoSlot(path.into())
    }

    /// `true` for error kinds a caller may reasonably retry at a higher layer
    /// (lock contention), as opposed to kinds that require the caller to change
    /// something (bad argument, missing entity).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockExhausted { .. })
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for KbError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageFailure(anyhow::Error::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KbError>;
