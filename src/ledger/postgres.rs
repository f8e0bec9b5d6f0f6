//! PostgreSQL record store
//!
//! Every query is written once, generic over the executor, and shared by
//! the pool-backed [`PgLedger`] and the transaction-backed [`PgLedgerTx`].

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgExecutor, Postgres, Row, Transaction};
use tracing::debug;

use super::error::{StoreError, sqlstate};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Currency, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer,
};
use super::queries::{LedgerQueries, LedgerTransaction, TransactionalStore};
use crate::core_types::{AccountId, EntryId, TransferId};

/// Pool-backed ledger. Each call outside a transaction auto-commits.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Ledger handle bound to an open Postgres transaction
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    /// Used to reach the server out of band while `tx` is busy
    pool: PgPool,
    backend_pid: i32,
}

#[async_trait]
impl TransactionalStore for PgLedger {
    type Queries = PgLedger;
    type Tx = PgLedgerTx;

    fn queries(&self) -> PgLedger {
        self.clone()
    }

    async fn begin(&self) -> Result<PgLedgerTx, StoreError> {
        let mut tx = self.pool.begin().await?;
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await?;
        Ok(PgLedgerTx {
            tx,
            pool: self.pool.clone(),
            backend_pid,
        })
    }
}

#[async_trait]
impl LedgerTransaction for PgLedgerTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// The connection is still waiting on the abandoned statement, so the
    /// cancel request goes through another pooled connection. A backend
    /// that is idle in transaction ignores it.
    async fn interrupt(&mut self) -> Result<(), StoreError> {
        let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .fetch_one(&self.pool)
            .await?;
        debug!(
            backend_pid = self.backend_pid,
            cancelled, "Interrupted transaction backend"
        );
        Ok(())
    }
}

// ============================================================================
// SQL
// ============================================================================

fn row_to_account(row: &PgRow) -> Result<Account, StoreError> {
    let currency: String = row.try_get("currency")?;
    let currency = currency
        .parse::<Currency>()
        .map_err(|e| StoreError::CorruptRow(e.to_string()))?;

    Ok(Account {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        currency,
        balance: row.try_get("balance")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<Entry, StoreError> {
    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, StoreError> {
    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn create_account<'e, E: PgExecutor<'e>>(
    executor: E,
    params: CreateAccountParams,
) -> Result<Account, StoreError> {
    let row = sqlx::query(
        r#"INSERT INTO accounts (owner, currency, balance) VALUES ($1, $2, $3) RETURNING id, owner, currency, balance, created_at"#,
    )
    .bind(&params.owner)
    .bind(params.currency.code())
    .bind(params.balance)
    .fetch_one(executor)
    .await?;

    row_to_account(&row)
}

async fn get_account<'e, E: PgExecutor<'e>>(
    executor: E,
    id: AccountId,
) -> Result<Account, StoreError> {
    let row = sqlx::query(
        r#"SELECT id, owner, currency, balance, created_at FROM accounts WHERE id = $1 LIMIT 1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => row_to_account(&row),
        None => Err(StoreError::account_not_found(id)),
    }
}

async fn list_accounts<'e, E: PgExecutor<'e>>(
    executor: E,
    params: ListAccountsParams,
) -> Result<Vec<Account>, StoreError> {
    let rows = sqlx::query(
        r#"SELECT id, owner, currency, balance, created_at FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"#,
    )
    .bind(&params.owner)
    .bind(params.limit)
    .bind(params.offset)
    .fetch_all(executor)
    .await?;

    rows.iter().map(row_to_account).collect()
}

/// Single-statement increment: the row lock is taken by the UPDATE itself,
/// so concurrent deltas on one account serialize instead of racing.
async fn add_account_balance<'e, E: PgExecutor<'e>>(
    executor: E,
    params: AddAccountBalanceParams,
) -> Result<Account, StoreError> {
    let row = sqlx::query(
        r#"UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING id, owner, currency, balance, created_at"#,
    )
    .bind(params.amount)
    .bind(params.id)
    .fetch_optional(executor)
    .await
    .map_err(|e| balance_update_error(e, params.id))?;

    match row {
        Some(row) => row_to_account(&row),
        None => Err(StoreError::account_not_found(params.id)),
    }
}

/// `bigint out of range` on the balance column is an overflow of that account
fn balance_update_error(e: sqlx::Error, id: AccountId) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE) {
            return StoreError::BalanceOverflow(id);
        }
    }
    e.into()
}

async fn create_entry<'e, E: PgExecutor<'e>>(
    executor: E,
    params: CreateEntryParams,
) -> Result<Entry, StoreError> {
    let row = sqlx::query(
        r#"INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING id, account_id, amount, created_at"#,
    )
    .bind(params.account_id)
    .bind(params.amount)
    .fetch_one(executor)
    .await?;

    row_to_entry(&row)
}

async fn get_entry<'e, E: PgExecutor<'e>>(executor: E, id: EntryId) -> Result<Entry, StoreError> {
    let row = sqlx::query(
        r#"SELECT id, account_id, amount, created_at FROM entries WHERE id = $1 LIMIT 1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => row_to_entry(&row),
        None => Err(StoreError::NotFound { entity: "entry", id }),
    }
}

async fn list_entries<'e, E: PgExecutor<'e>>(
    executor: E,
    params: ListEntriesParams,
) -> Result<Vec<Entry>, StoreError> {
    let rows = sqlx::query(
        r#"SELECT id, account_id, amount, created_at FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"#,
    )
    .bind(params.account_id)
    .bind(params.limit)
    .bind(params.offset)
    .fetch_all(executor)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

async fn create_transfer<'e, E: PgExecutor<'e>>(
    executor: E,
    params: CreateTransferParams,
) -> Result<Transfer, StoreError> {
    let row = sqlx::query(
        r#"INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING id, from_account_id, to_account_id, amount, created_at"#,
    )
    .bind(params.from_account_id)
    .bind(params.to_account_id)
    .bind(params.amount)
    .fetch_one(executor)
    .await?;

    row_to_transfer(&row)
}

async fn get_transfer<'e, E: PgExecutor<'e>>(
    executor: E,
    id: TransferId,
) -> Result<Transfer, StoreError> {
    let row = sqlx::query(
        r#"SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers WHERE id = $1 LIMIT 1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => row_to_transfer(&row),
        None => Err(StoreError::NotFound {
            entity: "transfer",
            id,
        }),
    }
}

async fn list_transfers<'e, E: PgExecutor<'e>>(
    executor: E,
    params: ListTransfersParams,
) -> Result<Vec<Transfer>, StoreError> {
    let rows = sqlx::query(
        r#"SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers
           WHERE from_account_id = $1 OR to_account_id = $2
           ORDER BY id LIMIT $3 OFFSET $4"#,
    )
    .bind(params.from_account_id)
    .bind(params.to_account_id)
    .bind(params.limit)
    .bind(params.offset)
    .fetch_all(executor)
    .await?;

    rows.iter().map(row_to_transfer).collect()
}

// ============================================================================
// LedgerQueries impls
// ============================================================================

/// Implements `LedgerQueries` by forwarding to the shared SQL functions
/// with the executor produced by `$exec`.
macro_rules! forward_ledger_queries {
    ($ty:ty, |$this:ident| $exec:expr) => {
        #[async_trait]
        impl LedgerQueries for $ty {
            async fn create_account(
                &mut self,
                params: CreateAccountParams,
            ) -> Result<Account, StoreError> {
                let $this = self;
                create_account($exec, params).await
            }

            async fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
                let $this = self;
                get_account($exec, id).await
            }

            async fn list_accounts(
                &mut self,
                params: ListAccountsParams,
            ) -> Result<Vec<Account>, StoreError> {
                let $this = self;
                list_accounts($exec, params).await
            }

            async fn add_account_balance(
                &mut self,
                params: AddAccountBalanceParams,
            ) -> Result<Account, StoreError> {
                debug!(account_id = params.id, amount = params.amount, "add_account_balance");
                let $this = self;
                add_account_balance($exec, params).await
            }

            async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, StoreError> {
                let $this = self;
                create_entry($exec, params).await
            }

            async fn get_entry(&mut self, id: EntryId) -> Result<Entry, StoreError> {
                let $this = self;
                get_entry($exec, id).await
            }

            async fn list_entries(
                &mut self,
                params: ListEntriesParams,
            ) -> Result<Vec<Entry>, StoreError> {
                let $this = self;
                list_entries($exec, params).await
            }

            async fn create_transfer(
                &mut self,
                params: CreateTransferParams,
            ) -> Result<Transfer, StoreError> {
                let $this = self;
                create_transfer($exec, params).await
            }

            async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, StoreError> {
                let $this = self;
                get_transfer($exec, id).await
            }

            async fn list_transfers(
                &mut self,
                params: ListTransfersParams,
            ) -> Result<Vec<Transfer>, StoreError> {
                let $this = self;
                list_transfers($exec, params).await
            }
        }
    };
}

forward_ledger_queries!(PgLedger, |this| &this.pool);
forward_ledger_queries!(PgLedgerTx, |this| &mut *this.tx);
