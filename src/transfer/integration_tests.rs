//! Integration Tests for the transfer engine
//!
//! Run the full engine against the in-memory ledger, which has real row
//! locks, so concurrency and atomicity properties are checked without a
//! live database.

#[cfg(test)]
mod integration_tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::core_types::MinorUnits;
    use crate::ledger::{
        Account, AddAccountBalanceParams, CreateAccountParams, Currency, ErrorKind, FaultPoint,
        LedgerQueries, MemoryLedger, StoreError, TransactionalStore,
    };
    use crate::transfer::{TransferEngine, TransferError, TransferParams};
    use crate::util::RandomSource;

    struct TestHarness {
        ledger: MemoryLedger,
        engine: Arc<TransferEngine<MemoryLedger>>,
        rng: RandomSource,
    }

    impl TestHarness {
        fn new() -> Self {
            let ledger = MemoryLedger::new();
            let engine = Arc::new(TransferEngine::new(Arc::new(ledger.clone())));
            Self {
                ledger,
                engine,
                rng: RandomSource::from_seed(0x5eed),
            }
        }

        async fn account(&mut self, balance: MinorUnits) -> Account {
            self.ledger
                .clone()
                .create_account(CreateAccountParams {
                    owner: self.rng.random_owner(),
                    currency: Currency::Usd,
                    balance,
                })
                .await
                .unwrap()
        }

        async fn balance(&self, account: &Account) -> MinorUnits {
            self.ledger
                .clone()
                .get_account(account.id)
                .await
                .unwrap()
                .balance
        }

        fn total(&self) -> MinorUnits {
            self.ledger.snapshot().accounts.iter().map(|a| a.balance).sum()
        }
    }

    // ========================================================================
    // Happy Path Tests
    // ========================================================================

    /// A(100) -> B(50), amount 30
    #[tokio::test]
    async fn test_single_transfer_example() {
        let mut h = TestHarness::new();
        let a = h.account(100).await;
        let b = h.account(50).await;

        let result = h
            .engine
            .execute(TransferParams::new(a.id, b.id, 30))
            .await
            .unwrap();

        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
        assert_eq!(h.balance(&a).await, 70);
        assert_eq!(h.balance(&b).await, 80);

        let snapshot = h.ledger.snapshot();
        assert_eq!(snapshot.transfers.len(), 1);
        assert_eq!(snapshot.entries.len(), 2);
    }

    /// Every committed transfer has exactly one debit and one credit entry
    #[tokio::test]
    async fn test_audit_completeness() {
        let mut h = TestHarness::new();
        let accounts = [
            h.account(500).await,
            h.account(500).await,
            h.account(500).await,
        ];

        for i in 0..9 {
            let from = &accounts[i % 3];
            let to = &accounts[(i + 1) % 3];
            let amount = h.rng.random_int(1, 50);
            h.engine
                .execute(TransferParams::new(from.id, to.id, amount))
                .await
                .unwrap();
        }

        let snapshot = h.ledger.snapshot();
        assert_eq!(snapshot.transfers.len(), 9);
        assert_eq!(snapshot.entries.len(), 18);
        for transfer in &snapshot.transfers {
            let has_debit = snapshot
                .entries
                .iter()
                .any(|e| {
                    e.account_id == transfer.from_account_id && e.amount == -transfer.amount
                });
            let has_credit = snapshot
                .entries
                .iter()
                .any(|e| e.account_id == transfer.to_account_id && e.amount == transfer.amount);
            assert!(has_debit && has_credit, "transfer {} lacks entries", transfer.id);
        }
        let entry_sum: MinorUnits = snapshot.entries.iter().map(|e| e.amount).sum();
        assert_eq!(entry_sum, 0);
        assert_eq!(h.total(), 1500);
    }

    // ========================================================================
    // Failure & Atomicity Tests
    // ========================================================================

    #[tokio::test]
    async fn test_nonexistent_source_creates_nothing() {
        let mut h = TestHarness::new();
        let b = h.account(50).await;
        let before = h.ledger.snapshot();

        let err = h
            .engine
            .execute(TransferParams::new(9999, b.id, 10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(h.ledger.snapshot(), before);
    }

    /// A failure at any step leaves all three tables unchanged
    #[tokio::test]
    async fn test_atomicity_at_every_step() {
        let faults = [
            (FaultPoint::CreateTransfer, 1),
            (FaultPoint::CreateEntry, 1),
            (FaultPoint::CreateEntry, 2),
            (FaultPoint::AddAccountBalance, 1),
            (FaultPoint::AddAccountBalance, 2),
            (FaultPoint::Commit, 1),
        ];

        for (point, nth) in faults {
            let mut h = TestHarness::new();
            let a = h.account(100).await;
            let b = h.account(50).await;
            let before = h.ledger.snapshot();
            let injected = StoreError::Unavailable(format!("{point:?} #{nth}"));
            h.ledger.fail_nth(point, nth, injected.clone());

            let err = h
                .engine
                .execute(TransferParams::new(a.id, b.id, 30))
                .await
                .unwrap_err();

            let expected = if point == FaultPoint::Commit {
                TransferError::Commit(injected)
            } else {
                TransferError::Store(injected)
            };
            assert_eq!(err, expected, "fault at {point:?} #{nth}");
            assert_eq!(h.ledger.snapshot(), before, "fault at {point:?} #{nth}");
        }
    }

    #[tokio::test]
    async fn test_rollback_failure_still_persists_nothing() {
        let mut h = TestHarness::new();
        let a = h.account(100).await;
        let b = h.account(50).await;
        let before = h.ledger.snapshot();
        h.ledger
            .fail_next(FaultPoint::CreateEntry, StoreError::account_not_found(b.id));
        h.ledger.fail_next(
            FaultPoint::Rollback,
            StoreError::Unavailable("connection reset".into()),
        );

        let err = h
            .engine
            .execute(TransferParams::new(a.id, b.id, 30))
            .await
            .unwrap_err();

        assert!(
            matches!(err, TransferError::RollbackFailed { .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(h.ledger.snapshot(), before);
    }

    #[tokio::test]
    async fn test_programmer_errors_fail_before_begin() {
        let mut h = TestHarness::new();
        let a = h.account(100).await;
        let b = h.account(50).await;

        for params in [
            TransferParams::new(a.id, b.id, 0),
            TransferParams::new(a.id, b.id, -1),
            TransferParams::new(a.id, a.id, 10),
        ] {
            let err = h.engine.execute(params).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        assert_eq!(h.ledger.stats().begun, 0);
    }

    /// A transfer blocked on a row lock is rolled back when its deadline
    /// expires
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_while_waiting_for_row_lock() {
        let mut h = TestHarness::new();
        let a = h.account(100).await;
        let b = h.account(50).await;

        // Hold a's row lock in a separate transaction
        let mut blocker = h.ledger.begin().await.unwrap();
        blocker
            .add_account_balance(AddAccountBalanceParams {
                id: a.id,
                amount: 0,
            })
            .await
            .unwrap();

        let timeout = Duration::from_millis(50);
        let result = h
            .engine
            .execute_with_timeout(TransferParams::new(a.id, b.id, 30), timeout)
            .await;
        assert_eq!(result, Err(TransferError::TimedOut(timeout)));
        drop(blocker);

        assert!(h.ledger.snapshot().transfers.is_empty());
        assert_eq!(h.balance(&a).await, 100);
        assert_eq!(h.balance(&b).await, 50);
    }

    /// Cancelling a transfer parked on a row lock returns `Cancelled` and
    /// discards the transfer and entries it had already staged
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_waiting_for_row_lock() {
        let mut h = TestHarness::new();
        let a = h.account(100).await;
        let b = h.account(50).await;
        let before = h.ledger.snapshot();

        let mut blocker = h.ledger.begin().await.unwrap();
        blocker
            .add_account_balance(AddAccountBalanceParams {
                id: a.id,
                amount: 0,
            })
            .await
            .unwrap();

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let engine = h.engine.clone();
        let transfer = tokio::spawn(async move {
            engine
                .execute_until(TransferParams::new(a.id, b.id, 30), async move {
                    let _ = cancel_rx.await;
                })
                .await
        });

        // Let the transfer stage its rows and park on a's lock
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transfer.is_finished());
        cancel_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), transfer)
            .await
            .expect("cancel did not stop the blocked transfer")
            .unwrap();
        assert_eq!(result, Err(TransferError::Cancelled));
        assert_eq!(h.ledger.stats().interrupted, 1);
        assert_eq!(h.ledger.stats().committed, 0);

        // The blocker's transaction is still open: nothing else was written
        assert_eq!(h.ledger.snapshot(), before);
        drop(blocker);
        assert_eq!(h.ledger.snapshot(), before);
    }

    // ========================================================================
    // Concurrency Tests
    // ========================================================================

    /// 5 concurrent transfers of 10 from A(1000) to B(500)
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_same_direction() {
        let mut h = TestHarness::new();
        let a = h.account(1000).await;
        let b = h.account(500).await;
        let n = 5;
        let amount = 10;

        let mut handles = Vec::new();
        for _ in 0..n {
            let engine = h.engine.clone();
            let params = TransferParams::new(a.id, b.id, amount);
            handles.push(tokio::spawn(async move { engine.execute(params).await }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.transfer.amount, amount);
            assert_eq!(result.from_entry.amount, -amount);
            assert_eq!(result.to_entry.amount, amount);

            let diff1 = a.balance - result.from_account.balance;
            let diff2 = result.to_account.balance - b.balance;
            assert_eq!(diff1, diff2);
            assert!(diff1 > 0 && diff1 % amount == 0);

            let k = diff1 / amount;
            assert!((1..=n).contains(&k), "k = {k}");
            assert!(seen.insert(k), "k = {k} seen twice");
        }

        assert_eq!(h.balance(&a).await, 1000 - n * amount);
        assert_eq!(h.balance(&b).await, 500 + n * amount);
        let snapshot = h.ledger.snapshot();
        assert_eq!(snapshot.transfers.len(), n as usize);
        assert_eq!(snapshot.entries.len(), 2 * n as usize);
    }

    /// Alternating-direction transfers between the same pair must not
    /// deadlock
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_opposite_directions() {
        let mut h = TestHarness::new();
        let a = h.account(1000).await;
        let b = h.account(500).await;
        let amount = 10;

        let mut handles = Vec::new();
        for i in 0..10 {
            let engine = h.engine.clone();
            let params = if i % 2 == 1 {
                TransferParams::new(b.id, a.id, amount)
            } else {
                TransferParams::new(a.id, b.id, amount)
            };
            handles.push(tokio::spawn(async move { engine.execute(params).await }));
        }

        let all = futures::future::join_all(handles);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("transfers deadlocked");
        for result in results {
            result.unwrap().unwrap();
        }

        assert_eq!(h.balance(&a).await, 1000);
        assert_eq!(h.balance(&b).await, 500);
        assert_eq!(h.ledger.snapshot().transfers.len(), 10);
    }

    /// N concurrent X -> Y transfers move exactly N * amount
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_lost_updates() {
        let mut h = TestHarness::new();
        let x = h.account(10_000).await;
        let y = h.account(0).await;
        let n: MinorUnits = 50;
        let amount = 7;

        let mut handles = Vec::new();
        for _ in 0..n {
            let engine = h.engine.clone();
            let params = TransferParams::new(x.id, y.id, amount);
            handles.push(tokio::spawn(async move { engine.execute(params).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.balance(&x).await, 10_000 - n * amount);
        assert_eq!(h.balance(&y).await, n * amount);
    }

    /// Random transfers across several accounts conserve the total
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_conservation_across_accounts() {
        let mut h = TestHarness::new();
        let mut accounts = Vec::new();
        for _ in 0..4 {
            accounts.push(h.account(1000).await);
        }
        let total = h.total();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let from = h.rng.random_int(0, 3) as usize;
            let to = (from + h.rng.random_int(1, 3) as usize) % 4;
            let amount = h.rng.random_int(1, 25);
            let params = TransferParams::new(accounts[from].id, accounts[to].id, amount);
            let engine = h.engine.clone();
            handles.push(tokio::spawn(async move { engine.execute(params).await }));
        }

        let all = futures::future::join_all(handles);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("transfers deadlocked");
        for result in results {
            result.unwrap().unwrap();
        }

        assert_eq!(h.total(), total);
        let snapshot = h.ledger.snapshot();
        assert_eq!(snapshot.entries.len(), 2 * snapshot.transfers.len());
    }
}
