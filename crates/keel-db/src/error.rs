//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A conditional update matched no row because the entity was not in the
    /// expected state (or the caller no longer owns its lease).
    #[error("{entity} {id} is {status}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
    },

    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Connectivity and contention failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db.code().is_some_and(|code| {
                    // 08xxx connection exceptions, serialization failure,
                    // deadlock, admin/crash shutdown, cannot connect now.
                    code.starts_with("08")
                        || matches!(code.as_ref(), "40001" | "40P01" | "57P01" | "57P02" | "57P03")
                }),
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<keel_core::Error> for DbError {
    fn from(err: keel_core::Error) -> Self {
        DbError::Decode(err.to_string())
    }
}

impl From<DbError> for keel_core::Error {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            return keel_core::Error::TransientStoreFailure(err.to_string());
        }
        match err {
            DbError::NotFound(what) => keel_core::Error::NotFound(what),
            DbError::InvalidState { entity, id, status } => {
                keel_core::Error::InvalidStateTransition { entity, id, status }
            }
            DbError::NotEligible(what) => keel_core::Error::NotEligible(what),
            DbError::Duplicate(what) => keel_core::Error::InvalidInput(what),
            other => keel_core::Error::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
