//! Ledger record store
//!
//! CRUD access to the `accounts`, `entries` and `transfers` tables. The
//! store has no transaction semantics of its own: atomicity is provided by
//! [`crate::transfer::TxCoordinator`] on top of [`TransactionalStore`].

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;

// Re-export commonly used types
pub use error::{ErrorKind, StoreError};
pub use memory::{FaultPoint, LedgerSnapshot, MemoryLedger, MemoryStats, MemoryTx};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Currency, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UnsupportedCurrency,
};
pub use postgres::{PgLedger, PgLedgerTx};
pub use queries::{LedgerQueries, LedgerTransaction, TransactionalStore};
