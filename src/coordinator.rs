//! Execution Coordinator
//!
//! The single entry point with mutation authority. Sequences the
//! idempotency store, safety validator, quote orchestrator, atomic
//! transaction manager, and confirmation tracker for one request, and
//! lands every outcome (success or failure) back in the idempotency
//! store so retries replay instead of re-entering the pipeline.

use crate::core_types::{ChainId, CurrencyPair, TxId, UserId};
use crate::error::CoreError;
use crate::executor::AtomicTransactionManager;
use crate::idempotency::{self, Begin, IdempotencyStore, StoredResult};
use crate::notify::{NotificationDispatcher, TxNotification};
use crate::quotes::{QuoteOrchestrator, QuoteRequest, SelectedQuote};
use crate::safety::SafetyValidator;
use crate::settlement::ConfirmationTracker;
use crate::transaction::{Side, Transaction, TxKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Interval and bound for waiting out a concurrent submission of the
/// same logical request.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(25);
const IN_FLIGHT_POLL_LIMIT: u32 = 400;

/// What a request handler asks the core to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub kind: TxKind,
    pub side: Option<Side>,
    pub pair: CurrencyPair,
    pub amount: Decimal,
    pub chain_id: Option<ChainId>,
    /// Other-leg amount for internal trades; swaps get theirs quoted.
    pub counter_amount: Option<Decimal>,
    /// Caller-supplied limit price, sanity-checked during validation.
    pub limit_price: Option<Decimal>,
}

impl ExecutionRequest {
    /// The semantic fields two duplicate submissions share.
    fn semantic_fields(&self) -> Vec<String> {
        vec![
            self.kind.as_str().to_string(),
            match self.side {
                Some(Side::Buy) => "BUY".into(),
                Some(Side::Sell) => "SELL".into(),
                None => "-".into(),
            },
            self.pair.to_string(),
            self.amount.normalize().to_string(),
            self.chain_id.map(|c| c.to_string()).unwrap_or_default(),
            self.limit_price
                .map(|p| p.normalize().to_string())
                .unwrap_or_else(|| "-".into()),
        ]
    }
}

/// A freshly executed outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub transaction: Transaction,
    /// Set when the selected quote's price impact was flagged.
    pub warning: Option<String>,
}

/// Result of `submit`: either this call executed the request, or a prior
/// identical submission did and its stored result is replayed.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    Executed(ExecutionOutcome),
    Replayed(StoredResult),
}

impl SubmitResult {
    /// The transaction id the caller should poll, regardless of which
    /// submission won.
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            SubmitResult::Executed(outcome) => Some(outcome.transaction.id),
            SubmitResult::Replayed(stored) => stored
                .payload
                .get("transaction")
                .and_then(|t| t.get("id"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok()),
        }
    }
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    idempotency: Arc<dyn IdempotencyStore>,
    validator: Arc<SafetyValidator>,
    quotes: Arc<QuoteOrchestrator>,
    manager: Arc<AtomicTransactionManager>,
    tracker: Arc<ConfirmationTracker>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl ExecutionCoordinator {
    pub fn new(
        idempotency: Arc<dyn IdempotencyStore>,
        validator: Arc<SafetyValidator>,
        quotes: Arc<QuoteOrchestrator>,
        manager: Arc<AtomicTransactionManager>,
        tracker: Arc<ConfirmationTracker>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            idempotency,
            validator,
            quotes,
            manager,
            tracker,
            notifier,
        }
    }

    /// Submit one money-moving request.
    ///
    /// Concurrent duplicates serialize on the idempotency key: one wins,
    /// the rest wait for its stored result. An unreachable idempotency
    /// store fails the request closed.
    pub async fn submit(
        &self,
        user_id: UserId,
        request: ExecutionRequest,
    ) -> Result<SubmitResult, CoreError> {
        let fields = request.semantic_fields();
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        let key = idempotency::derive_key(user_id, &refs);

        match self.idempotency.begin(&key, user_id).await {
            // Fail closed: skipping deduplication risks double execution.
            Err(e) => Err(CoreError::StoreUnavailable(e.to_string())),
            Ok(Begin::Replay(stored)) => {
                info!(user_id, key = %key, "replaying stored result");
                Ok(SubmitResult::Replayed(stored))
            }
            Ok(Begin::InFlight) => self.await_winner(user_id, &key, request).await,
            Ok(Begin::Fresh) => self.run_fresh(user_id, request, key).await,
        }
    }

    /// Read a transaction's current state.
    pub async fn status(&self, tx_id: TxId) -> Result<Transaction, CoreError> {
        self.manager
            .transaction_store()
            .get(tx_id)
            .await?
            .ok_or(CoreError::NotFound(tx_id))
    }

    /// Execute a request this call owns. The pipeline runs on its own
    /// task: a caller disconnecting mid-request must not cancel an
    /// in-flight commit.
    async fn run_fresh(
        &self,
        user_id: UserId,
        request: ExecutionRequest,
        key: String,
    ) -> Result<SubmitResult, CoreError> {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.pipeline(user_id, &request, &key).await;

            // Every path lands in `complete`, including failures, so
            // retries of this logical request replay instead of
            // re-executing. Error results are cached too.
            let stored = match &result {
                Ok(outcome) => StoredResult {
                    payload: serde_json::json!({
                        "transaction": outcome.transaction,
                        "warning": outcome.warning,
                    }),
                    status_code: 200,
                },
                Err(e) => StoredResult {
                    payload: serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string(),
                    }),
                    status_code: e.http_status(),
                },
            };
            if let Err(e) = this.idempotency.complete(&key, stored).await {
                warn!(key = %key, error = %e, "failed to store idempotency result");
            }
            result
        });

        let outcome = handle
            .await
            .map_err(|e| CoreError::Internal(format!("pipeline task failed: {e}")))??;
        Ok(SubmitResult::Executed(outcome))
    }

    /// Validate, quote, commit, and hand off to settlement tracking.
    async fn pipeline(
        &self,
        user_id: UserId,
        request: &ExecutionRequest,
        key: &str,
    ) -> Result<ExecutionOutcome, CoreError> {
        let mut tx = Transaction::new(
            user_id,
            request.kind,
            request.side,
            request.pair.clone(),
            request.amount,
        );
        tx.chain_id = request.chain_id;
        tx.counter_amount = request.counter_amount;
        tx.limit_price = request.limit_price;
        tx.idempotency_key = Some(key.to_string());

        self.validator.validate(user_id, &tx).await?;

        let selected: Option<SelectedQuote> = if tx.kind == TxKind::Swap {
            let req = QuoteRequest {
                pair: tx.pair.clone(),
                amount: tx.amount,
                chain_id: tx.chain_id.unwrap_or(1),
            };
            Some(self.quotes.best_quote(&req).await?)
        } else {
            None
        };
        let warning = selected.as_ref().filter(|s| s.flagged).map(|s| {
            format!(
                "price impact {} on provider {}",
                s.quote.price_impact, s.quote.provider
            )
        });

        let result = self.manager.execute(tx, selected.as_ref()).await;
        let tx = match result {
            Ok(tx) => tx,
            Err(e) => {
                // Failed executions feed the risk profile too (cooldown).
                if let Ok(Some(row)) = self.lookup_by_key(key).await {
                    self.validator.record_outcome(&row);
                    self.notify(&row);
                }
                return Err(e);
            }
        };

        if tx.kind.is_externally_settled() {
            // The chain hash arrives later via `set_hash`; the external
            // reference on the row is the aggregator id.
            self.tracker.register(&tx, None).await?;
            let tracker = self.tracker.clone();
            let tx_id = tx.id;
            tokio::spawn(async move {
                if let Err(e) = tracker.run_until_terminal(tx_id).await {
                    warn!(tx_id = %tx_id, error = %e, "settlement tracking ended with error");
                }
            });
        }

        self.validator.record_outcome(&tx);
        self.notify(&tx);
        Ok(ExecutionOutcome {
            transaction: tx,
            warning,
        })
    }

    async fn lookup_by_key(&self, key: &str) -> Result<Option<Transaction>, CoreError> {
        self.manager
            .transaction_store()
            .find_by_idempotency_key(key)
            .await
    }

    /// A concurrent identical submission holds the key: poll until its
    /// result is stored, then replay it.
    async fn await_winner(
        &self,
        user_id: UserId,
        key: &str,
        request: ExecutionRequest,
    ) -> Result<SubmitResult, CoreError> {
        for _ in 0..IN_FLIGHT_POLL_LIMIT {
            tokio::time::sleep(IN_FLIGHT_POLL).await;
            match self.idempotency.begin(key, user_id).await {
                Err(e) => return Err(CoreError::StoreUnavailable(e.to_string())),
                Ok(Begin::Replay(stored)) => return Ok(SubmitResult::Replayed(stored)),
                Ok(Begin::InFlight) => continue,
                // The winner's record expired mid-wait; this call now
                // owns the key.
                Ok(Begin::Fresh) => return self.run_fresh(user_id, request, key.to_string()).await,
            }
        }
        Err(CoreError::StoreUnavailable(
            "in-flight duplicate never completed".into(),
        ))
    }

    fn notify(&self, tx: &Transaction) {
        if !tx.status.is_terminal() && tx.status != crate::transaction::TxStatus::Executing {
            return;
        }
        let notifier = self.notifier.clone();
        let event = TxNotification::from_tx(tx);
        // Fire and forget: the core never waits on delivery.
        tokio::spawn(async move {
            notifier.dispatch(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::TREASURY_USER;
    use crate::executor::{ExecutorConfig, MemoryTransactionStore};
    use crate::idempotency::{IdempotencyError, MemoryIdempotencyStore};
    use crate::ledger::{AccountKey, LedgerStore, MemoryLedgerStore};
    use crate::notify::LogDispatcher;
    use crate::quotes::mock::MockProvider;
    use crate::quotes::orchestrator::QuoteConfig;
    use crate::quotes::ProviderRegistry;
    use crate::risk::{ProfileStore, RiskConfig};
    use crate::safety::mock::MockIdentity;
    use crate::safety::SafetyConfig;
    use crate::settlement::{MemorySettlementStore, ReconciliationQueue};
    use crate::settlement::tracker::SettlementConfig;
    use crate::transaction::TxStatus;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct NullChain;

    #[async_trait]
    impl crate::settlement::ChainReadProvider for NullChain {
        async fn transaction_status(
            &self,
            _hash: &str,
            _chain_id: ChainId,
        ) -> Result<crate::settlement::ChainTxStatus, crate::settlement::SettlementError> {
            Ok(crate::settlement::ChainTxStatus {
                state: crate::settlement::ChainTxState::Confirmed,
                confirmations: 12,
                block_number: Some(1),
            })
        }
    }

    fn build(providers: Vec<MockProvider>) -> (ExecutionCoordinator, Arc<MemoryLedgerStore>) {
        let ledger = Arc::new(MemoryLedgerStore::new());
        ledger.seed(AccountKey::new(1, "USDC"), dec!(100));
        ledger.seed(AccountKey::new(TREASURY_USER, "USDC"), dec!(100_000));
        ledger.seed(AccountKey::new(TREASURY_USER, "ETH"), dec!(1_000));

        let identity = Arc::new(MockIdentity::with_active(&[1]));
        let profiles = ProfileStore::new();
        let validator = Arc::new(SafetyValidator::new(
            SafetyConfig::default(),
            RiskConfig::default(),
            profiles,
            identity,
            ledger.clone(),
        ));

        let registry = ProviderRegistry::new();
        for p in providers {
            registry.register(Arc::new(p));
        }
        let quotes = Arc::new(QuoteOrchestrator::new(
            registry,
            QuoteConfig {
                max_wait_ms: 200,
                ..Default::default()
            },
        ));

        let manager = Arc::new(AtomicTransactionManager::new(
            ledger.clone(),
            Arc::new(MemoryTransactionStore::new()),
            ExecutorConfig {
                retry_backoff_ms: 1,
                ..Default::default()
            },
        ));
        let tracker = Arc::new(ConfirmationTracker::new(
            Arc::new(MemorySettlementStore::new()),
            Arc::new(NullChain),
            manager.clone(),
            Arc::new(ReconciliationQueue::new()),
            SettlementConfig {
                poll_interval_ms: 1,
                ..Default::default()
            },
        ));

        let coordinator = ExecutionCoordinator::new(
            Arc::new(MemoryIdempotencyStore::default()),
            validator,
            quotes,
            manager,
            tracker,
            Arc::new(LogDispatcher),
        );
        (coordinator, ledger)
    }

    fn swap_request(amount: Decimal) -> ExecutionRequest {
        ExecutionRequest {
            kind: TxKind::Swap,
            side: None,
            pair: CurrencyPair::new("USDC", "ETH"),
            amount,
            chain_id: Some(1),
            counter_amount: None,
            limit_price: None,
        }
    }

    #[tokio::test]
    async fn test_swap_scenario_end_to_end() {
        // Two of three providers respond with 49.00 and 49.50, one times
        // out; the winner is 49.50 and available drops 100 -> 50.
        let (coordinator, ledger) = build(vec![
            MockProvider::returning("a", dec!(49)),
            MockProvider::returning("b", dec!(49.50)),
            MockProvider::returning("slow", dec!(60))
                .with_delay(std::time::Duration::from_secs(5)),
        ]);

        let result = coordinator.submit(1, swap_request(dec!(50))).await.unwrap();
        let SubmitResult::Executed(outcome) = result else {
            panic!("expected fresh execution");
        };
        let tx = &outcome.transaction;
        assert_eq!(tx.counter_amount, Some(dec!(49.50)));
        assert_eq!(tx.external_ref.as_deref(), Some("b"));
        assert!(tx.status == TxStatus::Executing || tx.status == TxStatus::Completed);

        let acct = ledger
            .get(&AccountKey::new(1, "USDC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.available(), dec!(50));
    }

    #[tokio::test]
    async fn test_duplicate_submission_replays() {
        let (coordinator, ledger) = build(vec![MockProvider::returning("a", dec!(49.50))]);

        let first = coordinator.submit(1, swap_request(dec!(50))).await.unwrap();
        let second = coordinator.submit(1, swap_request(dec!(50))).await.unwrap();

        let first_id = first.tx_id().unwrap();
        match &second {
            SubmitResult::Replayed(stored) => {
                assert_eq!(stored.status_code, 200);
            }
            other => panic!("expected replay, got {:?}", other),
        }
        assert_eq!(second.tx_id().unwrap(), first_id);

        // Exactly one debit.
        let acct = ledger
            .get(&AccountKey::new(1, "USDC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.available(), dec!(50));
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_execute_once() {
        let (coordinator, ledger) = build(vec![MockProvider::returning("a", dec!(49.50))]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                c.submit(1, swap_request(dec!(50))).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().tx_id().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "all responses refer to one transaction");

        let acct = ledger
            .get(&AccountKey::new(1, "USDC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.available(), dec!(50));
    }

    #[tokio::test]
    async fn test_rejection_is_cached_and_replayed() {
        let (coordinator, _) = build(vec![MockProvider::returning("a", dec!(49.50))]);

        // Over the available balance: rejected before any quote call.
        let err = coordinator.submit(1, swap_request(dec!(500))).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientBalance { .. }));

        // The retry replays the cached failure.
        let replay = coordinator.submit(1, swap_request(dec!(500))).await.unwrap();
        match replay {
            SubmitResult::Replayed(stored) => {
                assert_eq!(stored.status_code, 422);
                assert_eq!(
                    stored.payload.get("error").and_then(|v| v.as_str()),
                    Some("INSUFFICIENT_BALANCE")
                );
            }
            other => panic!("expected replayed failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_quote_is_transient_and_touches_nothing() {
        let (coordinator, ledger) = build(vec![MockProvider::returning("a", dec!(49.50)).failing()]);
        let err = coordinator.submit(1, swap_request(dec!(50))).await.unwrap_err();
        assert!(matches!(err, CoreError::NoQuoteAvailable));
        assert!(err.is_retryable());
        let acct = ledger
            .get(&AccountKey::new(1, "USDC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.available(), dec!(100));
    }

    #[tokio::test]
    async fn test_flagged_quote_surfaces_warning() {
        let (coordinator, _) = build(vec![
            MockProvider::returning("imp", dec!(49.50)).with_impact(dec!(0.03)),
        ]);
        let result = coordinator.submit(1, swap_request(dec!(50))).await.unwrap();
        let SubmitResult::Executed(outcome) = result else {
            panic!("expected fresh execution");
        };
        assert!(outcome.warning.as_deref().unwrap().contains("price impact"));
    }

    /// Idempotency store that always errors, to verify fail-closed.
    struct DownStore;

    #[async_trait]
    impl IdempotencyStore for DownStore {
        async fn begin(&self, _key: &str, _user_id: UserId) -> Result<Begin, IdempotencyError> {
            Err(IdempotencyError::Unavailable("down".into()))
        }

        async fn complete(
            &self,
            _key: &str,
            _result: StoredResult,
        ) -> Result<(), IdempotencyError> {
            Err(IdempotencyError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_fails_closed_when_idempotency_store_down() {
        let (built, ledger) = build(vec![MockProvider::returning("a", dec!(49.50))]);
        let coordinator = ExecutionCoordinator::new(
            Arc::new(DownStore),
            built.validator.clone(),
            built.quotes.clone(),
            built.manager.clone(),
            built.tracker.clone(),
            Arc::new(LogDispatcher),
        );
        let err = coordinator.submit(1, swap_request(dec!(50))).await.unwrap_err();
        assert!(matches!(err, CoreError::StoreUnavailable(_)));
        let acct = ledger
            .get(&AccountKey::new(1, "USDC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.available(), dec!(100));
    }

    #[tokio::test]
    async fn test_status_lookup() {
        let (coordinator, _) = build(vec![MockProvider::returning("a", dec!(49.50))]);
        let result = coordinator.submit(1, swap_request(dec!(50))).await.unwrap();
        let id = result.tx_id().unwrap();
        let row = coordinator.status(id).await.unwrap();
        assert_eq!(row.id, id);
        assert!(matches!(
            coordinator.status(uuid::Uuid::new_v4()).await.unwrap_err(),
            CoreError::NotFound(_)
        ));
    }
}
