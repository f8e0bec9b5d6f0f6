//! Record store contracts
//!
//! [`LedgerQueries`] is the plain CRUD capability set. It is implemented
//! both by auto-commit handles and by transaction handles, so the same
//! code runs inside or outside a transaction.
//!
//! Transaction capability is layered on top: a [`TransactionalStore`]
//! hands out [`LedgerTransaction`] handles, which are `LedgerQueries`
//! plus `commit`/`rollback`.

use async_trait::async_trait;

use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use crate::core_types::{AccountId, EntryId, TransferId};

/// CRUD access to accounts, entries and transfers
#[async_trait]
pub trait LedgerQueries: Send {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account, StoreError>;

    /// Returns `StoreError::NotFound` if the account does not exist
    async fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError>;

    async fn list_accounts(&mut self, params: ListAccountsParams)
    -> Result<Vec<Account>, StoreError>;

    /// Atomically add `amount` to the balance and return the updated row.
    ///
    /// The row stays locked until the enclosing transaction ends. This is
    /// the only way a balance may change.
    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, params: ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    async fn create_transfer(&mut self, params: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, StoreError>;

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError>;
}

/// A transaction-scoped record store handle.
///
/// Writes are visible only through this handle until `commit`. Dropping
/// the handle without finishing it discards its writes.
#[async_trait]
pub trait LedgerTransaction: LedgerQueries + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;

    /// Cancel a statement that may still be running on this transaction
    /// after its caller stopped waiting for it. Must be called before
    /// `rollback` when a query future was dropped mid-flight, otherwise the
    /// rollback queues behind that statement (for example a row lock wait).
    async fn interrupt(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Storage that can open transactions
#[async_trait]
pub trait TransactionalStore: Send + Sync + 'static {
    /// Auto-commit handle sharing the same storage
    type Queries: LedgerQueries;

    type Tx: LedgerTransaction + 'static;

    fn queries(&self) -> Self::Queries;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}
