//! Transaction Coordinator
//!
//! Runs a unit of work inside one store transaction: begin, run, then
//! commit on success or roll back on any failure. Exactly one attempt is
//! made per call; retry policy belongs to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::error::TransferError;
use crate::ledger::{LedgerTransaction, TransactionalStore};

/// Transaction Coordinator - owns the begin/commit/rollback lifecycle
pub struct TxCoordinator<S> {
    store: Arc<S>,
}

impl<S> Clone for TxCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: TransactionalStore> TxCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `work` in a fresh transaction
    pub async fn run<T, F>(&self, work: F) -> Result<T, TransferError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, TransferError>> + Send,
    {
        self.execute(std::future::pending::<()>(), TransferError::Cancelled, work)
            .await
    }

    /// Run `work`, aborting with `Cancelled` if `cancel` resolves first.
    ///
    /// An aborted unit of work is dropped and its transaction rolled back.
    pub async fn run_until<T, F, C>(&self, cancel: C, work: F) -> Result<T, TransferError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, TransferError>> + Send,
        C: Future<Output = ()> + Send,
    {
        self.execute(cancel, TransferError::Cancelled, work).await
    }

    /// Run `work` under a deadline, aborting with `TimedOut` when it expires
    pub async fn run_with_timeout<T, F>(
        &self,
        timeout: Duration,
        work: F,
    ) -> Result<T, TransferError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, TransferError>> + Send,
    {
        self.execute(
            tokio::time::sleep(timeout),
            TransferError::TimedOut(timeout),
            work,
        )
        .await
    }

    /// Shared body of the `run*` variants. `aborted` is returned when
    /// `cancel` resolves first.
    pub(crate) async fn execute<T, F, C>(
        &self,
        cancel: C,
        aborted: TransferError,
        work: F,
    ) -> Result<T, TransferError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, TransferError>> + Send,
        C: Future<Output = ()> + Send,
    {
        tokio::pin!(cancel);

        let begun = tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!(error = %aborted, "Aborted before transaction began");
                return Err(aborted);
            }
            begun = self.store.begin() => begun,
        };
        let mut tx = begun.map_err(|e| {
            warn!(error = %e, "Begin transaction failed");
            TransferError::Begin(e)
        })?;
        debug!("Transaction begun");

        let finished = tokio::select! {
            biased;
            _ = &mut cancel => None,
            result = work(&mut tx) => Some(result),
        };

        let outcome = match finished {
            Some(result) => result,
            None => {
                // The dropped unit of work may have left a statement
                // running; it must stop before the rollback can be sent
                if let Err(e) = tx.interrupt().await {
                    error!(
                        error = %aborted,
                        rollback_error = %e,
                        "Interrupt failed, abandoning transaction"
                    );
                    return Err(TransferError::RollbackFailed {
                        source: Box::new(aborted),
                        rollback: e,
                    });
                }
                Err(aborted)
            }
        };

        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(|e| {
                    warn!(error = %e, "Commit failed");
                    TransferError::Commit(e)
                })?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => Err(abort(tx, err).await),
        }
    }
}

/// Roll back after a failed unit of work, keeping both errors if the
/// rollback fails too
async fn abort<Tx: LedgerTransaction>(tx: Tx, err: TransferError) -> TransferError {
    match tx.rollback().await {
        Ok(()) => {
            debug!(error = %err, "Transaction rolled back");
            err
        }
        Err(rollback) => {
            error!(error = %err, rollback_error = %rollback, "Rollback failed");
            TransferError::RollbackFailed {
                source: Box::new(err),
                rollback,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        CreateAccountParams, Currency, FaultPoint, LedgerQueries, MemoryLedger, MemoryStats,
        StoreError,
    };

    fn setup() -> (MemoryLedger, TxCoordinator<MemoryLedger>) {
        let ledger = MemoryLedger::new();
        let coordinator = TxCoordinator::new(Arc::new(ledger.clone()));
        (ledger, coordinator)
    }

    fn alice() -> CreateAccountParams {
        CreateAccountParams {
            owner: "alice".to_string(),
            currency: Currency::Usd,
            balance: 100,
        }
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (ledger, coordinator) = setup();

        let account = coordinator
            .run(|tx| {
                Box::pin(async move {
                    tx.create_account(alice())
                        .await
                        .map_err(TransferError::from)
                })
            })
            .await
            .unwrap();

        assert_eq!(ledger.snapshot().accounts, vec![account]);
        assert_eq!(
            ledger.stats(),
            MemoryStats {
                begun: 1,
                committed: 1,
                rolled_back: 0,
                interrupted: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_rollback_on_failure() {
        let (ledger, coordinator) = setup();

        let result: Result<(), _> = coordinator
            .run(|tx| {
                Box::pin(async move {
                    tx.create_account(alice()).await?;
                    Err(TransferError::SameAccount)
                })
            })
            .await;

        assert_eq!(result, Err(TransferError::SameAccount));
        assert!(ledger.snapshot().accounts.is_empty());
        assert_eq!(ledger.stats().rolled_back, 1);
        assert_eq!(ledger.stats().committed, 0);
        // The unit of work finished on its own, nothing to interrupt
        assert_eq!(ledger.stats().interrupted, 0);
    }

    #[tokio::test]
    async fn test_interrupt_failure_keeps_abort_reason() {
        let (ledger, coordinator) = setup();
        let interrupt_err = StoreError::Unavailable("pool timed out".into());
        ledger.fail_next(FaultPoint::Interrupt, interrupt_err.clone());
        let timeout = Duration::from_millis(20);

        let result = coordinator
            .run_with_timeout(timeout, |tx| {
                Box::pin(async move {
                    tx.create_account(alice()).await?;
                    std::future::pending::<()>().await;
                    Ok::<_, TransferError>(())
                })
            })
            .await;

        assert_eq!(
            result,
            Err(TransferError::RollbackFailed {
                source: Box::new(TransferError::TimedOut(timeout)),
                rollback: interrupt_err,
            })
        );
        // Dropping the abandoned transaction still discards its writes
        assert!(ledger.snapshot().accounts.is_empty());
        assert_eq!(ledger.stats().committed, 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_combines_errors() {
        let (ledger, coordinator) = setup();
        let rollback_err = StoreError::Unavailable("connection reset".into());
        ledger.fail_next(FaultPoint::Rollback, rollback_err.clone());

        let result: Result<(), _> = coordinator
            .run(|tx| {
                Box::pin(async move {
                    tx.create_account(alice()).await?;
                    Err(TransferError::Store(StoreError::account_not_found(9)))
                })
            })
            .await;

        assert_eq!(
            result,
            Err(TransferError::RollbackFailed {
                source: Box::new(TransferError::Store(StoreError::account_not_found(9))),
                rollback: rollback_err,
            })
        );
        assert!(ledger.snapshot().accounts.is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_fails_the_call() {
        let (ledger, coordinator) = setup();
        let commit_err = StoreError::SerializationFailure("could not serialize access".into());
        ledger.fail_next(FaultPoint::Commit, commit_err.clone());

        let result = coordinator
            .run(|tx| {
                Box::pin(async move {
                    tx.create_account(alice())
                        .await
                        .map_err(TransferError::from)
                })
            })
            .await;

        assert_eq!(result, Err(TransferError::Commit(commit_err)));
        assert!(ledger.snapshot().accounts.is_empty());
        assert_eq!(ledger.stats().committed, 0);
    }

    #[tokio::test]
    async fn test_begin_failure() {
        let (ledger, coordinator) = setup();
        let begin_err = StoreError::Unavailable("pool timed out".into());
        ledger.fail_next(FaultPoint::Begin, begin_err.clone());

        let result = coordinator
            .run(|tx| {
                Box::pin(async move {
                    tx.create_account(alice())
                        .await
                        .map_err(TransferError::from)
                })
            })
            .await;

        assert_eq!(result, Err(TransferError::Begin(begin_err)));
        assert_eq!(ledger.stats(), MemoryStats::default());
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let (ledger, coordinator) = setup();
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let run = coordinator.run_until(
            async move {
                let _ = cancel_rx.await;
            },
            |tx| {
                Box::pin(async move {
                    tx.create_account(alice()).await?;
                    std::future::pending::<()>().await;
                    Ok::<_, TransferError>(())
                })
            },
        );
        let cancel = async move {
            tokio::task::yield_now().await;
            let _ = cancel_tx.send(());
        };
        let (result, ()) = tokio::join!(run, cancel);

        assert_eq!(result, Err(TransferError::Cancelled));
        assert!(ledger.snapshot().accounts.is_empty());
        assert_eq!(ledger.stats().rolled_back, 1);
        assert_eq!(ledger.stats().interrupted, 1);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let (ledger, coordinator) = setup();
        let timeout = Duration::from_millis(20);

        let result = coordinator
            .run_with_timeout(timeout, |tx| {
                Box::pin(async move {
                    tx.create_account(alice()).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, TransferError>(())
                })
            })
            .await;

        assert_eq!(result, Err(TransferError::TimedOut(timeout)));
        assert!(ledger.snapshot().accounts.is_empty());
        assert_eq!(ledger.stats().rolled_back, 1);
        assert_eq!(ledger.stats().interrupted, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_begin() {
        let (ledger, coordinator) = setup();

        let result = coordinator
            .run_until(std::future::ready(()), |tx| {
                Box::pin(async move {
                    tx.create_account(alice())
                        .await
                        .map_err(TransferError::from)
                })
            })
            .await;

        assert_eq!(result, Err(TransferError::Cancelled));
        assert_eq!(ledger.stats().begun, 0);
    }
}
