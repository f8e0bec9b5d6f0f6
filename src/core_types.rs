//! Core types used throughout the ledger
//!
//! Identifiers are the Postgres `BIGSERIAL` primary keys of the three
//! ledger tables. Amounts are signed minor currency units.

/// Account ID - unique, immutable after creation.
///
/// # Lock Ordering:
/// Transfers always update the account with the smaller ID first, so
/// the numeric order of this type is part of the deadlock-freedom
/// contract of the transfer engine.
pub type AccountId = i64;

/// Entry ID - one entry per account per transfer
pub type EntryId = i64;

/// Transfer ID
pub type TransferId = i64;

/// Money amount in minor currency units (cents).
///
/// Signed: entries carry negative amounts for debits.
pub type MinorUnits = i64;
