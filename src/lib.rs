//! Bank Ledger - double-entry funds transfer engine
//!
//! Accounts, an append-only entry log and a transfer log, kept consistent
//! by running every transfer as one database transaction.
//!
//! # Modules
//!
//! - [`core_types`] - Id and amount aliases
//! - [`ledger`] - Record store: models, store traits, Postgres and in-memory backends
//! - [`transfer`] - Transaction coordinator, transfer engine and caller-side service
//! - [`db`] - Connection pool and schema bootstrap
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing subscriber setup
//! - [`util`] - Random test data

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod transfer;
pub mod util;

// Convenient re-exports at crate root
pub use core_types::{AccountId, EntryId, MinorUnits, TransferId};
pub use ledger::{
    Account, Currency, Entry, ErrorKind, LedgerQueries, MemoryLedger, PgLedger, StoreError,
    TransactionalStore, Transfer,
};
pub use transfer::{
    TransferEngine, TransferError, TransferParams, TransferRequest, TransferResult,
    TransferService, TxCoordinator,
};
