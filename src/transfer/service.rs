//! Transfer Service
//!
//! Caller-side entry point: validates requests against the current account
//! state, runs the engine under the configured deadline and retries
//! transient failures.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::engine::{TransferEngine, TransferParams, TransferResult};
use super::error::TransferError;
use crate::config::TransferConfig;
use crate::core_types::{AccountId, MinorUnits};
use crate::ledger::{
    Account, CreateAccountParams, Currency, ErrorKind, LedgerQueries, ListAccountsParams,
    TransactionalStore,
};

/// Largest page `list_accounts` will return
pub const MAX_PAGE_SIZE: i32 = 10;

/// Transfer request as submitted by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: MinorUnits,
    pub currency: Currency,
}

impl TransferRequest {
    pub fn params(&self) -> TransferParams {
        TransferParams::new(self.from_account_id, self.to_account_id, self.amount)
    }
}

/// Transfer Service
pub struct TransferService<S> {
    store: Arc<S>,
    engine: TransferEngine<S>,
    config: TransferConfig,
}

impl<S: TransactionalStore> TransferService<S> {
    pub fn new(store: Arc<S>, config: TransferConfig) -> Self {
        let engine = TransferEngine::new(store.clone());
        Self {
            store,
            engine,
            config,
        }
    }

    pub fn engine(&self) -> &TransferEngine<S> {
        &self.engine
    }

    /// Open an account with a zero balance
    pub async fn create_account(
        &self,
        owner: &str,
        currency: Currency,
    ) -> Result<Account, TransferError> {
        let account = self
            .store
            .queries()
            .create_account(CreateAccountParams {
                owner: owner.to_string(),
                currency,
                balance: 0,
            })
            .await?;
        info!(account_id = account.id, owner, %currency, "Account created");
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account, TransferError> {
        self.store.queries().get_account(id).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TransferError::AccountNotFound(id)
            } else {
                e.into()
            }
        })
    }

    /// List an owner's accounts, `page_id` counting from 1
    pub async fn list_accounts(
        &self,
        owner: &str,
        page_id: i32,
        page_size: i32,
    ) -> Result<Vec<Account>, TransferError> {
        if page_id < 1 || !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(TransferError::InvalidPage {
                max_page_size: MAX_PAGE_SIZE,
            });
        }

        let accounts = self
            .store
            .queries()
            .list_accounts(ListAccountsParams {
                owner: owner.to_string(),
                limit: i64::from(page_size),
                offset: i64::from(page_id - 1) * i64::from(page_size),
            })
            .await?;
        Ok(accounts)
    }

    /// Validate and execute a transfer, retrying transient failures
    pub async fn create_transfer(
        &self,
        req: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let params = req.params();
        params.validate()?;

        let from_account = self.valid_account(req.from_account_id, req.currency).await?;
        self.valid_account(req.to_account_id, req.currency).await?;

        // Advisory only: the balance may change before the transfer commits
        if !self.config.allow_overdraft && from_account.balance < req.amount {
            return Err(TransferError::InsufficientBalance {
                account_id: from_account.id,
                balance: from_account.balance,
                amount: req.amount,
            });
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.config.timeout() {
                Some(timeout) => self.engine.execute_with_timeout(params, timeout).await,
                None => self.engine.execute(params).await,
            };

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        from = req.from_account_id,
                        to = req.to_account_id,
                        error = %e,
                        "Transient transfer failure, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn valid_account(
        &self,
        id: AccountId,
        currency: Currency,
    ) -> Result<Account, TransferError> {
        let account = self.get_account(id).await?;
        if account.currency != currency {
            return Err(TransferError::CurrencyMismatch {
                account_id: id,
                actual: account.currency,
                expected: currency,
            });
        }
        Ok(account)
    }
}
