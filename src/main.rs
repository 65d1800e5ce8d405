//! clearcore demo binary.
//!
//! Wires the full in-memory stack and drives one swap end to end:
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌────────┐   ┌──────────┐   ┌─────────┐
//! │ Request │──▶│Idempotency│──▶│ Safety │──▶│  Quotes  │──▶│ Commit  │
//! └─────────┘   └───────────┘   └────────┘   └──────────┘   └────┬────┘
//!                                                                │
//!                                              ┌─────────────────▼───┐
//!                                              │ Confirmation Tracker │
//!                                              └──────────────────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::info;

use clearcore::config::AppConfig;
use clearcore::coordinator::{ExecutionCoordinator, ExecutionRequest, SubmitResult};
use clearcore::core_types::{ChainId, CurrencyPair, TREASURY_USER};
use clearcore::executor::{AtomicTransactionManager, MemoryTransactionStore};
use clearcore::idempotency::MemoryIdempotencyStore;
use clearcore::ledger::{AccountKey, LedgerStore, MemoryLedgerStore};
use clearcore::logging::init_logging;
use clearcore::notify::LogDispatcher;
use clearcore::quotes::{
    ProviderRegistry, Quote, QuoteError, QuoteOrchestrator, QuoteProvider, QuoteRequest,
};
use clearcore::risk::ProfileStore;
use clearcore::safety::{AccountStatus, AccountStatusProvider, SafetyValidator};
use clearcore::settlement::{
    ChainReadProvider, ChainTxState, ChainTxStatus, ConfirmationTracker, MemorySettlementStore,
    ReconciliationQueue, SettlementError,
};
use clearcore::transaction::TxKind;
use clearcore::{CoreError, UserId};

/// Simulated aggregator with a fixed spread off a reference price.
struct DemoProvider {
    name: &'static str,
    rate: rust_decimal::Decimal,
    impact: rust_decimal::Decimal,
}

#[async_trait]
impl QuoteProvider for DemoProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn quote(&self, req: &QuoteRequest) -> Result<Quote, QuoteError> {
        Ok(Quote {
            provider: self.name.to_string(),
            price: self.rate,
            buy_amount: req.amount * self.rate,
            fee: dec!(0.05),
            price_impact: self.impact,
            expires_at: Utc::now() + ChronoDuration::seconds(30),
            raw: serde_json::json!({ "source": self.name }),
        })
    }
}

/// Chain view that confirms everything after a couple of polls.
struct DemoChain;

#[async_trait]
impl ChainReadProvider for DemoChain {
    async fn transaction_status(
        &self,
        _hash: &str,
        _chain_id: ChainId,
    ) -> Result<ChainTxStatus, SettlementError> {
        Ok(ChainTxStatus {
            state: ChainTxState::Confirmed,
            confirmations: 12,
            block_number: Some(19_000_001),
        })
    }
}

/// Everyone the demo knows about is active.
struct OpenIdentity;

#[async_trait]
impl AccountStatusProvider for OpenIdentity {
    async fn account_status(&self, _user_id: UserId) -> Result<Option<AccountStatus>, CoreError> {
        Ok(Some(AccountStatus::Active))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load_or_default("dev");
    let _guard = init_logging(&config);

    let ledger = Arc::new(MemoryLedgerStore::new());
    ledger.seed(AccountKey::new(1, "USDC"), dec!(100));
    ledger.seed(AccountKey::new(TREASURY_USER, "USDC"), dec!(1_000_000));
    ledger.seed(AccountKey::new(TREASURY_USER, "ETH"), dec!(500));

    let validator = Arc::new(SafetyValidator::new(
        config.safety.clone(),
        config.risk.clone(),
        ProfileStore::new(),
        Arc::new(OpenIdentity),
        ledger.clone(),
    ));

    let registry = ProviderRegistry::new();
    registry.register(Arc::new(DemoProvider {
        name: "agg-alpha",
        rate: dec!(0.98),
        impact: dec!(0.002),
    }));
    registry.register(Arc::new(DemoProvider {
        name: "agg-beta",
        rate: dec!(0.99),
        impact: dec!(0.004),
    }));
    let quotes = Arc::new(QuoteOrchestrator::new(registry, config.quotes.clone()));

    let manager = Arc::new(AtomicTransactionManager::new(
        ledger.clone(),
        Arc::new(MemoryTransactionStore::new()),
        config.executor.clone(),
    ));

    let tracker = Arc::new(ConfirmationTracker::new(
        Arc::new(MemorySettlementStore::new()),
        Arc::new(DemoChain),
        manager.clone(),
        Arc::new(ReconciliationQueue::new()),
        config.settlement.clone(),
    ));
    tracker.resume().await?;

    let coordinator = ExecutionCoordinator::new(
        Arc::new(MemoryIdempotencyStore::new(config.idempotency.ttl_secs)),
        validator,
        quotes,
        manager,
        tracker.clone(),
        Arc::new(LogDispatcher),
    );

    let request = ExecutionRequest {
        kind: TxKind::Swap,
        side: None,
        pair: CurrencyPair::new("USDC", "ETH"),
        amount: dec!(50),
        chain_id: Some(1),
        counter_amount: None,
        limit_price: None,
    };

    let result = coordinator.submit(1, request.clone()).await?;
    let tx_id = match &result {
        SubmitResult::Executed(outcome) => {
            info!(
                tx_id = %outcome.transaction.id,
                status = %outcome.transaction.status,
                received = ?outcome.transaction.counter_amount,
                provider = ?outcome.transaction.external_ref,
                "swap executed"
            );
            outcome.transaction.id
        }
        SubmitResult::Replayed(stored) => {
            info!(status_code = stored.status_code, "replayed stored result");
            return Ok(());
        }
    };

    // A duplicate submission replays instead of re-executing.
    if let SubmitResult::Replayed(stored) = coordinator.submit(1, request).await? {
        info!(status_code = stored.status_code, "duplicate replayed");
    }

    // Hand the provider-assigned hash to the tracker and follow the
    // settlement to its terminal state.
    tracker.set_hash(tx_id, "0xdemo").await?;
    let record = tracker.run_until_terminal(tx_id).await?;
    info!(state = %record.state, "settlement finished");

    let usdc = ledger.get(&AccountKey::new(1, "USDC")).await?;
    let eth = ledger.get(&AccountKey::new(1, "ETH")).await?;
    info!(
        usdc_available = %usdc.map(|a| a.available()).unwrap_or_default(),
        eth_balance = %eth.map(|a| a.balance()).unwrap_or_default(),
        "final balances"
    );
    Ok(())
}
