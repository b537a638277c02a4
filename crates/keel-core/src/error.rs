//! Error types for Keel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The lock was not obtained before the caller's deadline.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// The session holding the lock died; exclusivity can no longer be assumed.
    #[error("lock lost: {0}")]
    LockLost(String),

    #[error("invalid state transition: {entity} {id} is {status}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        status: String,
    },

    #[error("transient store failure: {0}")]
    TransientStoreFailure(String),

    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStoreFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
