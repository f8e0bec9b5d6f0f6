//! Funds transfer
//!
//! # Architecture
//!
//! ```text
//! TransferService ──▶ TransferEngine ──▶ TxCoordinator ──▶ TransactionalStore
//!   (validation,        (transfer +        (begin/commit/      (PgLedger,
//!    retry, deadline)    entries + deltas)   rollback)           MemoryLedger)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **All or nothing**: the transfer, both entries and both balance
//!    deltas commit in one transaction or not at all
//! 2. **Lock ordering**: balance deltas are applied to the lower account id
//!    first, so concurrent transfers over the same pair cannot deadlock
//! 3. **No read-then-write**: balances only change through the atomic
//!    `add_account_balance` primitive
//! 4. **No hidden retries**: the engine makes one attempt per call; only
//!    `TransferService` retries, and only transient failures

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod service;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use coordinator::TxCoordinator;
pub use engine::{TransferEngine, TransferParams, TransferResult};
pub use error::TransferError;
pub use service::{MAX_PAGE_SIZE, TransferRequest, TransferService};
