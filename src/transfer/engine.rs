//! Transfer Engine
//!
//! Moves funds between two accounts in a single transaction: one transfer
//! record, one debit entry, one credit entry and the two balance deltas.
//!
//! Balance deltas are always applied lower account id first, whichever side
//! of the transfer that account is on. Every transfer touching the same
//! pair of accounts therefore takes the row locks in the same order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::coordinator::TxCoordinator;
use super::error::TransferError;
use crate::core_types::{AccountId, MinorUnits};
use crate::ledger::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry,
    LedgerQueries, TransactionalStore, Transfer,
};

/// Funds movement request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: MinorUnits,
}

impl TransferParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: MinorUnits) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Reject requests that can never succeed
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.amount <= 0 {
            return Err(TransferError::InvalidAmount(self.amount));
        }
        if self.from_account_id == self.to_account_id {
            return Err(TransferError::SameAccount);
        }
        Ok(())
    }
}

/// Everything a committed transfer wrote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    /// Source account after the debit
    pub from_account: Account,
    /// Target account after the credit
    pub to_account: Account,
}

/// Transfer Engine - the only entry point that moves funds
pub struct TransferEngine<S> {
    coordinator: TxCoordinator<S>,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<S: TransactionalStore> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_coordinator(TxCoordinator::new(store))
    }

    pub fn with_coordinator(coordinator: TxCoordinator<S>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &TxCoordinator<S> {
        &self.coordinator
    }

    /// Execute a transfer. On error nothing is persisted.
    pub async fn execute(&self, params: TransferParams) -> Result<TransferResult, TransferError> {
        self.execute_until(params, std::future::pending::<()>()).await
    }

    /// Execute a transfer, rolling back with `Cancelled` if `cancel`
    /// resolves first
    pub async fn execute_until<C>(
        &self,
        params: TransferParams,
        cancel: C,
    ) -> Result<TransferResult, TransferError>
    where
        C: Future<Output = ()> + Send,
    {
        self.submit(params, cancel, TransferError::Cancelled).await
    }

    /// Execute a transfer under a deadline
    pub async fn execute_with_timeout(
        &self,
        params: TransferParams,
        timeout: Duration,
    ) -> Result<TransferResult, TransferError> {
        self.submit(
            params,
            tokio::time::sleep(timeout),
            TransferError::TimedOut(timeout),
        )
        .await
    }

    /// Validate, then run one transfer attempt. `aborted` is returned if
    /// `cancel` resolves before the transfer commits.
    async fn submit<C>(
        &self,
        params: TransferParams,
        cancel: C,
        aborted: TransferError,
    ) -> Result<TransferResult, TransferError>
    where
        C: Future<Output = ()> + Send,
    {
        params.validate()?;
        debug!(
            from = params.from_account_id,
            to = params.to_account_id,
            amount = params.amount,
            "Executing transfer"
        );

        let result = self
            .coordinator
            .execute(cancel, aborted, |tx| Box::pin(apply_transfer(tx, params)))
            .await?;
        log_committed(&result);
        Ok(result)
    }
}

fn log_committed(result: &TransferResult) {
    info!(
        transfer_id = result.transfer.id,
        from = result.transfer.from_account_id,
        to = result.transfer.to_account_id,
        amount = result.transfer.amount,
        from_balance = result.from_account.balance,
        to_balance = result.to_account.balance,
        "Transfer committed"
    );
}

/// The transfer unit of work. Any error aborts at the failing step.
async fn apply_transfer<Q: LedgerQueries>(
    q: &mut Q,
    params: TransferParams,
) -> Result<TransferResult, TransferError> {
    let TransferParams {
        from_account_id,
        to_account_id,
        amount,
    } = params;

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id,
            to_account_id,
            amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: from_account_id,
            amount: -amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: to_account_id,
            amount,
        })
        .await?;

    let (from_account, to_account) = if from_account_id < to_account_id {
        move_balances(q, from_account_id, -amount, to_account_id, amount).await?
    } else {
        let (to_account, from_account) =
            move_balances(q, to_account_id, amount, from_account_id, -amount).await?;
        (from_account, to_account)
    };

    Ok(TransferResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Apply two deltas in the given order. The second is never issued if the
/// first fails.
async fn move_balances<Q: LedgerQueries>(
    q: &mut Q,
    first_id: AccountId,
    first_amount: MinorUnits,
    second_id: AccountId,
    second_amount: MinorUnits,
) -> Result<(Account, Account), TransferError> {
    debug!(first = first_id, second = second_id, "Applying balance deltas");

    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first_id,
            amount: first_amount,
        })
        .await?;
    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second_id,
            amount: second_amount,
        })
        .await?;
    Ok((first, second))
}
