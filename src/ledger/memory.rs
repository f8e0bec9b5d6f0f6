//! In-process ledger store
//!
//! Keeps the three tables in memory and gives transactions the properties
//! the transfer engine relies on from Postgres:
//!
//! - **Row locks**: `add_account_balance` takes an exclusive per-account
//!   lock held until the transaction ends. A second transaction updating
//!   the same account waits, exactly like a Postgres `UPDATE`.
//! - **Staged writes**: inserts and balance changes stay private to the
//!   transaction and are applied under the table lock at commit.
//! - **Constraints**: foreign keys from entries and transfers to accounts,
//!   one account per `(owner, currency)`, positive transfer amounts.
//!
//! Faults can be injected at fixed points to exercise failure paths.
//! Auto-commit calls made through [`MemoryLedger`] itself bypass fault
//! injection and are not counted in [`MemoryStats`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use super::queries::{LedgerQueries, LedgerTransaction, TransactionalStore};
use crate::core_types::{AccountId, EntryId, TransferId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn page<T>(mut rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.drain(..offset.min(rows.len()));
    rows.truncate(limit);
    rows
}

/// Operation at which a fault can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    CreateTransfer,
    CreateEntry,
    AddAccountBalance,
    Commit,
    Rollback,
    Interrupt,
}

#[derive(Debug)]
struct Fault {
    point: FaultPoint,
    /// Hits to let through before failing
    skip: usize,
    error: StoreError,
}

/// Transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Transactions whose in-flight statement was abandoned by the caller
    pub interrupted: usize,
}

/// Committed contents of all three tables, ordered by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub accounts: Vec<Account>,
    pub entries: Vec<Entry>,
    pub transfers: Vec<Transfer>,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<Vec<Fault>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    interrupted: AtomicUsize,
}

impl Shared {
    fn row_lock(&self, id: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.row_locks).entry(id).or_default().clone()
    }

    fn check_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        if let Some(pos) = faults.iter().position(|f| f.point == point) {
            if faults[pos].skip == 0 {
                let fault = faults.remove(pos);
                trace!(?point, error = %fault.error, "Injected fault fired");
                return Err(fault.error);
            }
            faults[pos].skip -= 1;
        }
        Ok(())
    }
}

/// Shared in-memory ledger. Clones refer to the same storage.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    shared: Arc<Shared>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th (1-based) upcoming hit of `point` once with `error`
    pub fn fail_nth(&self, point: FaultPoint, n: usize, error: StoreError) {
        lock(&self.shared.faults).push(Fault {
            point,
            skip: n.saturating_sub(1),
            error,
        });
    }

    /// Fail the next hit of `point` once with `error`
    pub fn fail_next(&self, point: FaultPoint, error: StoreError) {
        self.fail_nth(point, 1, error);
    }

    pub fn clear_faults(&self) {
        lock(&self.shared.faults).clear();
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            begun: self.shared.begun.load(Ordering::SeqCst),
            committed: self.shared.committed.load(Ordering::SeqCst),
            rolled_back: self.shared.rolled_back.load(Ordering::SeqCst),
            interrupted: self.shared.interrupted.load(Ordering::SeqCst),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let tables = lock(&self.shared.tables);
        LedgerSnapshot {
            accounts: tables.accounts.values().cloned().collect(),
            entries: tables.entries.values().cloned().collect(),
            transfers: tables.transfers.values().cloned().collect(),
        }
    }

    fn open(&self, tracked: bool) -> MemoryTx {
        MemoryTx {
            shared: self.shared.clone(),
            tracked,
            finished: false,
            row_guards: HashMap::new(),
            accounts: BTreeMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        }
    }

    async fn autocommit<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: for<'t> FnOnce(
            &'t mut MemoryTx,
        ) -> futures::future::BoxFuture<'t, Result<T, StoreError>>,
    {
        let mut tx = self.open(false);
        let out = op(&mut tx).await?;
        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl TransactionalStore for MemoryLedger {
    type Queries = MemoryLedger;
    type Tx = MemoryTx;

    fn queries(&self) -> MemoryLedger {
        self.clone()
    }

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        self.shared.check_fault(FaultPoint::Begin)?;
        self.shared.begun.fetch_add(1, Ordering::SeqCst);
        Ok(self.open(true))
    }
}

/// Open transaction against a [`MemoryLedger`]
pub struct MemoryTx {
    shared: Arc<Shared>,
    tracked: bool,
    finished: bool,
    /// Account rows locked by this transaction, released on drop
    row_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    /// Accounts inserted or updated by this transaction
    accounts: BTreeMap<AccountId, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryTx {
    fn fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        if self.tracked {
            self.shared.check_fault(point)
        } else {
            Ok(())
        }
    }

    fn visible_account(&self, id: AccountId) -> Option<Account> {
        if let Some(account) = self.accounts.get(&id) {
            return Some(account.clone());
        }
        lock(&self.shared.tables).accounts.get(&id).cloned()
    }

    fn account_exists(&self, id: AccountId) -> bool {
        self.accounts.contains_key(&id) || lock(&self.shared.tables).accounts.contains_key(&id)
    }

    fn missing_account(table: &str, column: &str, id: AccountId) -> StoreError {
        StoreError::ForeignKeyViolation(format!(
            "{table}.{column} = {id} is not present in table \"accounts\""
        ))
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished && self.tracked {
            self.shared.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.fault(FaultPoint::Commit)?;

        {
            let mut tables = lock(&self.shared.tables);

            // Uniqueness of concurrently inserted accounts is only known now
            for account in self.accounts.values() {
                if tables.accounts.contains_key(&account.id) {
                    continue;
                }
                let taken = tables
                    .accounts
                    .values()
                    .any(|a| a.owner == account.owner && a.currency == account.currency);
                if taken {
                    return Err(StoreError::UniqueViolation(format!(
                        "accounts (owner, currency) = ({}, {}) already exists",
                        account.owner, account.currency
                    )));
                }
            }

            for (id, account) in std::mem::take(&mut self.accounts) {
                tables.accounts.insert(id, account);
            }
            for entry in std::mem::take(&mut self.entries) {
                tables.entries.insert(entry.id, entry);
            }
            for transfer in std::mem::take(&mut self.transfers) {
                tables.transfers.insert(transfer.id, transfer);
            }
        }

        self.finished = true;
        if self.tracked {
            self.shared.committed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.fault(FaultPoint::Rollback)?;
        self.finished = true;
        if self.tracked {
            self.shared.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Lock waits are plain futures here, so dropping them already
    /// abandoned the statement; only the counter moves.
    async fn interrupt(&mut self) -> Result<(), StoreError> {
        self.fault(FaultPoint::Interrupt)?;
        if self.tracked {
            self.shared.interrupted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerQueries for MemoryTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account, StoreError> {
        let duplicate = self
            .accounts
            .values()
            .chain(lock(&self.shared.tables).accounts.values())
            .any(|a| a.owner == params.owner && a.currency == params.currency);
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "accounts (owner, currency) = ({}, {}) already exists",
                params.owner, params.currency
            )));
        }

        let account = Account {
            id: self.shared.account_seq.fetch_add(1, Ordering::SeqCst) + 1,
            owner: params.owner,
            currency: params.currency,
            balance: params.balance,
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.visible_account(id)
            .ok_or_else(|| StoreError::account_not_found(id))
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        let mut merged: BTreeMap<AccountId, Account> = lock(&self.shared.tables)
            .accounts
            .values()
            .filter(|a| a.owner == params.owner)
            .map(|a| (a.id, a.clone()))
            .collect();
        for account in self.accounts.values().filter(|a| a.owner == params.owner) {
            merged.insert(account.id, account.clone());
        }

        Ok(page(
            merged.into_values().collect(),
            params.limit,
            params.offset,
        ))
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.fault(FaultPoint::AddAccountBalance)?;

        if !self.row_guards.contains_key(&params.id) {
            let row = self.shared.row_lock(params.id);
            let guard = row.lock_owned().await;
            self.row_guards.insert(params.id, guard);
        }

        let mut account = self
            .visible_account(params.id)
            .ok_or_else(|| StoreError::account_not_found(params.id))?;
        account.balance = account
            .balance
            .checked_add(params.amount)
            .ok_or(StoreError::BalanceOverflow(params.id))?;

        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError> {
        self.fault(FaultPoint::CreateEntry)?;

        if !self.account_exists(params.account_id) {
            return Err(Self::missing_account(
                "entries",
                "account_id",
                params.account_id,
            ));
        }

        let entry = Entry {
            id: self.shared.entry_seq.fetch_add(1, Ordering::SeqCst) + 1,
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry, StoreError> {
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        lock(&self.shared.tables)
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "entry", id })
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let mut rows: Vec<Entry> = lock(&self.shared.tables)
            .entries
            .values()
            .filter(|e| e.account_id == params.account_id)
            .cloned()
            .collect();
        rows.extend(
            self.entries
                .iter()
                .filter(|e| e.account_id == params.account_id)
                .cloned(),
        );
        rows.sort_by_key(|e| e.id);

        Ok(page(rows, params.limit, params.offset))
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.fault(FaultPoint::CreateTransfer)?;

        if params.amount <= 0 {
            return Err(StoreError::CheckViolation(format!(
                "transfers.amount must be positive, got {}",
                params.amount
            )));
        }
        if !self.account_exists(params.from_account_id) {
            return Err(Self::missing_account(
                "transfers",
                "from_account_id",
                params.from_account_id,
            ));
        }
        if !self.account_exists(params.to_account_id) {
            return Err(Self::missing_account(
                "transfers",
                "to_account_id",
                params.to_account_id,
            ));
        }

        let transfer = Transfer {
            id: self.shared.transfer_seq.fetch_add(1, Ordering::SeqCst) + 1,
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, StoreError> {
        if let Some(transfer) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        lock(&self.shared.tables)
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "transfer",
                id,
            })
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let matches = |t: &&Transfer| {
            t.from_account_id == params.from_account_id || t.to_account_id == params.to_account_id
        };
        let mut rows: Vec<Transfer> = lock(&self.shared.tables)
            .transfers
            .values()
            .filter(matches)
            .cloned()
            .collect();
        rows.extend(self.transfers.iter().filter(matches).cloned());
        rows.sort_by_key(|t| t.id);

        Ok(page(rows, params.limit, params.offset))
    }
}

#[async_trait]
impl LedgerQueries for MemoryLedger {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.create_account(params)).await
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.get_account(id)).await
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        self.autocommit(|tx| tx.list_accounts(params)).await
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.add_account_balance(params)).await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError> {
        self.autocommit(|tx| tx.create_entry(params)).await
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry, StoreError> {
        self.autocommit(|tx| tx.get_entry(id)).await
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        self.autocommit(|tx| tx.list_entries(params)).await
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.autocommit(|tx| tx.create_transfer(params)).await
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, StoreError> {
        self.autocommit(|tx| tx.get_transfer(id)).await
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.autocommit(|tx| tx.list_transfers(params)).await
    }
}
