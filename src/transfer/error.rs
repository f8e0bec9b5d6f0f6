//! Transfer Error Types
//!
//! One error type for the coordinator, the engine and the caller-side
//! service. Store failures are carried unmodified in `Store`.

use std::time::Duration;

use thiserror::Error;

use crate::core_types::{AccountId, MinorUnits};
use crate::ledger::{Currency, ErrorKind, StoreError};

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(MinorUnits),

    #[error("Source and target account cannot be the same")]
    SameAccount,

    #[error("Invalid page: page_id must be >= 1 and page_size in 1..={max_page_size}")]
    InvalidPage { max_page_size: i32 },

    // === Account Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("account [{account_id}] currency mismatch: {actual} vs {expected}")]
    CurrencyMismatch {
        account_id: AccountId,
        actual: Currency,
        expected: Currency,
    },

    #[error("Insufficient balance on account {account_id}: {balance} < {amount}")]
    InsufficientBalance {
        account_id: AccountId,
        balance: MinorUnits,
        amount: MinorUnits,
    },

    // === Store Errors ===
    #[error(transparent)]
    Store(#[from] StoreError),

    // === Transaction Errors ===
    #[error("Begin transaction failed: {0}")]
    Begin(StoreError),

    #[error("Commit failed: {0}")]
    Commit(StoreError),

    /// The unit of work failed and the rollback failed too
    #[error("tx err: {source}, rb err: {rollback}")]
    RollbackFailed {
        source: Box<TransferError>,
        rollback: StoreError,
    },

    #[error("Transaction cancelled")]
    Cancelled,

    #[error("Transaction timed out after {0:?}")]
    TimedOut(Duration),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount(_) => "INVALID_AMOUNT",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidPage { .. } => "INVALID_PAGE",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            TransferError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            TransferError::Store(e) => e.code(),
            TransferError::Begin(_) => "BEGIN_FAILED",
            TransferError::Commit(_) => "COMMIT_FAILED",
            TransferError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            TransferError::Cancelled => "CANCELLED",
            TransferError::TimedOut(_) => "TIMED_OUT",
        }
    }

    /// Error class for the transport layer to map
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidAmount(_)
            | TransferError::SameAccount
            | TransferError::InvalidPage { .. }
            | TransferError::CurrencyMismatch { .. } => ErrorKind::InvalidInput,
            TransferError::AccountNotFound(_) => ErrorKind::NotFound,
            TransferError::InsufficientBalance { .. } => ErrorKind::Conflict,
            TransferError::Store(e) => e.kind(),
            TransferError::Begin(e) | TransferError::Commit(e) => match e.kind() {
                kind @ (ErrorKind::Unavailable | ErrorKind::Transient) => kind,
                _ => ErrorKind::Internal,
            },
            TransferError::RollbackFailed { .. } => ErrorKind::Internal,
            TransferError::Cancelled | TransferError::TimedOut(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the whole transfer may succeed
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
