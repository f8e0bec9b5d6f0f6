//! Record store error types
//!
//! Errors are reported as the storage engine classifies them. The store
//! never reinterprets a failure; classification into caller-facing
//! outcomes happens through [`ErrorKind`].

use thiserror::Error;

use crate::core_types::AccountId;

/// Coarse error classes a caller can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad parameters, rejected before touching storage
    InvalidInput,
    /// A referenced row does not exist
    NotFound,
    /// A constraint rejected the write
    Conflict,
    /// Storage cannot be reached
    Unavailable,
    /// Safe to retry the whole operation (serialization failure, deadlock)
    Transient,
    /// Aborted by the caller's cancellation signal or deadline
    Cancelled,
    Internal,
}

/// Record store error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Unique violation: {0}")]
    UniqueViolation(String),

    #[error("Check violation: {0}")]
    CheckViolation(String),

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(AccountId),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn account_not_found(id: AccountId) -> Self {
        StoreError::NotFound {
            entity: "account",
            id,
        }
    }

    /// Error code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            StoreError::UniqueViolation(_) => "UNIQUE_VIOLATION",
            StoreError::CheckViolation(_) => "CHECK_VIOLATION",
            StoreError::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            StoreError::SerializationFailure(_) => "SERIALIZATION_FAILURE",
            StoreError::Unavailable(_) => "STORAGE_UNAVAILABLE",
            StoreError::CorruptRow(_) => "CORRUPT_ROW",
            StoreError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// A foreign key violation means a referenced account is missing, so
    /// it belongs to the not-found class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } | StoreError::ForeignKeyViolation(_) => ErrorKind::NotFound,
            StoreError::UniqueViolation(_)
            | StoreError::CheckViolation(_)
            | StoreError::BalanceOverflow(_) => ErrorKind::Conflict,
            StoreError::SerializationFailure(_) => ErrorKind::Transient,
            StoreError::Unavailable(_) => ErrorKind::Unavailable,
            StoreError::CorruptRow(_) | StoreError::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Postgres SQLSTATE codes the store distinguishes
pub(crate) mod sqlstate {
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some(sqlstate::FOREIGN_KEY_VIOLATION) => StoreError::ForeignKeyViolation(message),
                    Some(sqlstate::UNIQUE_VIOLATION) => StoreError::UniqueViolation(message),
                    Some(sqlstate::CHECK_VIOLATION) => StoreError::CheckViolation(message),
                    Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE) => StoreError::CheckViolation(message),
                    Some(sqlstate::SERIALIZATION_FAILURE) | Some(sqlstate::DEADLOCK_DETECTED) => {
                        StoreError::SerializationFailure(message)
                    }
                    _ => StoreError::Database(e.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::CorruptRow(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}
