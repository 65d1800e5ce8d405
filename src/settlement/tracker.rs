//! Confirmation polling state machine.
//!
//! One background task per tracked settlement, independent of the
//! originating request's lifetime. State lives in the [`SettlementStore`],
//! so `resume` can pick every non-terminal settlement back up after a
//! process restart.

use super::{
    ChainReadProvider, ChainTxState, ReconciliationCause, ReconciliationQueue, SettlementError,
    SettlementRecord, SettlementState, SettlementStore,
};
use crate::core_types::TxId;
use crate::error::CoreError;
use crate::executor::AtomicTransactionManager;
use crate::transaction::Transaction;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub poll_interval_ms: u64,
    /// Ceiling for the exponential backoff on provider errors.
    pub max_backoff_ms: u64,
    /// Confirmations before a settlement is considered final.
    pub required_confirmations: u32,
    /// Total tracking window before a settlement is timed out and parked.
    pub max_tracking_secs: i64,
    /// Reversal attempts before parking for manual reconciliation.
    pub max_reversal_attempts: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_backoff_ms: 30_000,
            required_confirmations: 12,
            max_tracking_secs: 3_600,
            max_reversal_attempts: 10,
        }
    }
}

pub struct ConfirmationTracker {
    store: Arc<dyn SettlementStore>,
    chain: Arc<dyn ChainReadProvider>,
    manager: Arc<AtomicTransactionManager>,
    reconciliation: Arc<ReconciliationQueue>,
    cfg: SettlementConfig,
}

impl ConfirmationTracker {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        chain: Arc<dyn ChainReadProvider>,
        manager: Arc<AtomicTransactionManager>,
        reconciliation: Arc<ReconciliationQueue>,
        cfg: SettlementConfig,
    ) -> Self {
        Self {
            store,
            chain,
            manager,
            reconciliation,
            cfg,
        }
    }

    pub fn reconciliation(&self) -> Arc<ReconciliationQueue> {
        self.reconciliation.clone()
    }

    /// Register a committed externally-settled transaction for tracking.
    pub async fn register(
        &self,
        tx: &Transaction,
        tx_hash: Option<String>,
    ) -> Result<SettlementRecord, CoreError> {
        let chain_id = tx.chain_id.unwrap_or(1);
        let record = SettlementRecord::new(tx.id, chain_id, tx_hash);
        self.store
            .upsert(&record)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        info!(tx_id = %tx.id, state = %record.state, "settlement registered");
        Ok(record)
    }

    /// Attach the provider-assigned chain hash (`submitted -> pending`).
    pub async fn set_hash(&self, tx_id: TxId, tx_hash: &str) -> Result<(), CoreError> {
        let mut record = self
            .store
            .get(tx_id)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?
            .ok_or(CoreError::NotFound(tx_id))?;
        record.tx_hash = Some(tx_hash.to_string());
        if record.state == SettlementState::Submitted {
            record.state = SettlementState::Pending;
        }
        record.updated_at = Utc::now();
        self.store
            .upsert(&record)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// One provider query and the transitions it implies. Terminal states
    /// are written back before returning.
    pub async fn poll_once(&self, record: &mut SettlementRecord) -> Result<(), SettlementError> {
        let Some(hash) = record.tx_hash.clone() else {
            // Nothing to poll until the provider assigns a hash.
            return Ok(());
        };
        let status = self.chain.transaction_status(&hash, record.chain_id).await?;

        match status.state {
            ChainTxState::Pending => {
                if record.state == SettlementState::Submitted {
                    record.state = SettlementState::Pending;
                }
            }
            ChainTxState::Confirmed => {
                record.confirmations = status.confirmations;
                if record.state != SettlementState::Confirmed && !record.state.is_terminal() {
                    record.state = SettlementState::Confirmed;
                    // Surfaced to the caller as completed on first
                    // inclusion; internal tracking continues.
                    self.manager
                        .mark_confirmed(record.tx_id)
                        .await
                        .map_err(|e| SettlementError::Unavailable(e.to_string()))?;
                }
                if status.confirmations >= self.cfg.required_confirmations {
                    self.manager
                        .finalize(record.tx_id)
                        .await
                        .map_err(|e| SettlementError::Unavailable(e.to_string()))?;
                    record.state = SettlementState::Finalized;
                    info!(tx_id = %record.tx_id, confirmations = status.confirmations, "settlement finalized");
                }
            }
            ChainTxState::Failed | ChainTxState::Reverted => {
                warn!(tx_id = %record.tx_id, chain_state = ?status.state, "settlement regressed, compensating");
                self.compensate(record).await;
            }
        }

        record.updated_at = Utc::now();
        self.store.upsert(record).await?;
        Ok(())
    }

    /// Reverse the ledger movement for a reorged or chain-failed
    /// settlement, retrying until it lands. If every attempt fails the
    /// chain state is still reverted, so the record goes terminal and the
    /// unresolved ledger discrepancy is parked for an operator.
    async fn compensate(&self, record: &mut SettlementRecord) {
        for attempt in 1..=self.cfg.max_reversal_attempts {
            match self.manager.reverse(record.tx_id).await {
                Ok(_) => {
                    record.state = SettlementState::Reverted;
                    return;
                }
                Err(e) => {
                    warn!(tx_id = %record.tx_id, attempt, error = %e, "reversal attempt failed");
                    self.backoff(attempt).await;
                }
            }
        }
        record.state = SettlementState::Reverted;
        self.reconciliation.push(
            record.tx_id,
            ReconciliationCause::ReversalFailed,
            "compensating reversal exhausted retries",
        );
    }

    /// Drive one settlement to a terminal state. Runs as a background
    /// task; the originating request does not wait for it.
    pub async fn run_until_terminal(&self, tx_id: TxId) -> Result<SettlementRecord, CoreError> {
        let mut error_streak: u32 = 0;
        loop {
            let mut record = self
                .store
                .get(tx_id)
                .await
                .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?
                .ok_or(CoreError::NotFound(tx_id))?;
            if record.state.is_terminal() {
                return Ok(record);
            }

            if Utc::now() - record.registered_at
                > ChronoDuration::seconds(self.cfg.max_tracking_secs)
            {
                return self.time_out(record).await;
            }

            match self.poll_once(&mut record).await {
                Ok(()) => {
                    error_streak = 0;
                    if record.state.is_terminal() {
                        return Ok(record);
                    }
                    tokio::time::sleep(Duration::from_millis(self.cfg.poll_interval_ms)).await;
                }
                Err(e) => {
                    error_streak += 1;
                    warn!(tx_id = %tx_id, error_streak, error = %e, "poll failed, backing off");
                    self.backoff(error_streak).await;
                }
            }
        }
    }

    async fn time_out(
        &self,
        mut record: SettlementRecord,
    ) -> Result<SettlementRecord, CoreError> {
        self.manager.mark_confirmation_timeout(record.tx_id).await?;
        record.state = SettlementState::TimedOut;
        record.updated_at = Utc::now();
        self.store
            .upsert(&record)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        self.reconciliation.push(
            record.tx_id,
            ReconciliationCause::ConfirmationTimeout,
            "settlement never reached a terminal chain state",
        );
        Ok(record)
    }

    /// Resume tracking of every non-terminal settlement after a restart.
    /// Returns the spawned task handles.
    pub async fn resume(
        self: &Arc<Self>,
    ) -> Result<Vec<JoinHandle<Result<SettlementRecord, CoreError>>>, CoreError> {
        let active = self
            .store
            .load_active()
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        info!(count = active.len(), "resuming settlement tracking");
        let mut handles = Vec::with_capacity(active.len());
        for record in active {
            let tracker = self.clone();
            handles.push(tokio::spawn(async move {
                tracker.run_until_terminal(record.tx_id).await
            }));
        }
        Ok(handles)
    }

    /// Exponential backoff with jitter, capped at `max_backoff_ms`.
    async fn backoff(&self, streak: u32) {
        let base = self
            .cfg
            .poll_interval_ms
            .saturating_mul(1u64 << streak.min(16))
            .min(self.cfg.max_backoff_ms)
            .max(1);
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }
}
