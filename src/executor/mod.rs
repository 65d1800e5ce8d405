//! Atomic Transaction Manager
//!
//! Owns every mutation of the ledger and the transaction table. One call
//! to [`AtomicTransactionManager::execute`] stages all ledger movements
//! for a validated transaction as a single [`LedgerBatch`] and commits it
//! all-or-nothing; a failure after commit triggers the batch's
//! deterministic inverse so funds are never partially applied.
//!
//! Ledger movement per kind:
//! - Trade: user and treasury exchange the two legs (double entry, so
//!   per-currency totals are conserved exactly).
//! - Deposit: credit the user (funds enter from outside the ledger).
//! - Withdrawal: reserve at commit; captured on finalized settlement,
//!   released on reversal.
//! - Swap: debit the sold leg, credit the quoted net output; reversed as
//!   the exact inverse after a chain reorganization.

use crate::core_types::{TxId, TREASURY_USER};
use crate::error::CoreError;
use crate::ledger::{AccountKey, LedgerBatch, LedgerError, LedgerOp, LedgerStore};
use crate::quotes::SelectedQuote;
use crate::transaction::{Side, Transaction, TxKind, TxStatus};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Durable transaction row storage. Uniqueness of id and idempotency key
/// is the store's responsibility, not only the application's.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new row; fails if the id or idempotency key exists.
    async fn insert(&self, tx: &Transaction) -> Result<(), CoreError>;

    async fn get(&self, id: TxId) -> Result<Option<Transaction>, CoreError>;

    async fn find_by_idempotency_key(&self, key: &str)
        -> Result<Option<Transaction>, CoreError>;

    /// Overwrite an existing row.
    async fn persist(&self, tx: &Transaction) -> Result<(), CoreError>;
}

/// In-memory transaction store with the same uniqueness guarantees a SQL
/// schema enforces via constraints.
#[derive(Default)]
pub struct MemoryTransactionStore {
    rows: DashMap<TxId, Transaction>,
    by_key: DashMap<String, TxId>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, tx: &Transaction) -> Result<(), CoreError> {
        if let Some(key) = &tx.idempotency_key {
            use dashmap::mapref::entry::Entry;
            match self.by_key.entry(key.clone()) {
                Entry::Occupied(existing) if *existing.get() != tx.id => {
                    return Err(CoreError::Internal(format!(
                        "idempotency key already bound: {key}"
                    )));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(tx.id);
                }
            }
        }
        if self.rows.contains_key(&tx.id) {
            return Err(CoreError::Internal(format!("duplicate transaction id: {}", tx.id)));
        }
        self.rows.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get(&self, id: TxId) -> Result<Option<Transaction>, CoreError> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        let Some(id) = self.by_key.get(key).map(|r| *r) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn persist(&self, tx: &Transaction) -> Result<(), CoreError> {
        match self.rows.get_mut(&tx.id) {
            Some(mut row) => {
                *row = tx.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(tx.id)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts before a version conflict surfaces as `ConcurrencyConflict`.
    pub max_commit_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Commit never left in doubt: past this the attempt is failed.
    pub commit_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 3,
            retry_backoff_ms: 20,
            commit_timeout_ms: 5_000,
        }
    }
}

pub struct AtomicTransactionManager {
    ledger: Arc<dyn LedgerStore>,
    txs: Arc<dyn TransactionStore>,
    cfg: ExecutorConfig,
}

impl AtomicTransactionManager {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        txs: Arc<dyn TransactionStore>,
        cfg: ExecutorConfig,
    ) -> Self {
        Self { ledger, txs, cfg }
    }

    pub fn transaction_store(&self) -> Arc<dyn TransactionStore> {
        self.txs.clone()
    }

    /// Execute a validated transaction to a terminal (or `Executing`)
    /// state. Re-entrant: a second call with an id that already reached a
    /// post-pending state returns the existing row unchanged.
    pub async fn execute(
        &self,
        mut tx: Transaction,
        quote: Option<&SelectedQuote>,
    ) -> Result<Transaction, CoreError> {
        if let Some(existing) = self.txs.get(tx.id).await? {
            if existing.status != TxStatus::Pending {
                info!(tx_id = %tx.id, status = %existing.status, "re-entrant execute, returning existing row");
                return Ok(existing);
            }
        } else {
            self.txs.insert(&tx).await?;
        }

        if let Some(sel) = quote {
            tx.counter_amount = Some(sel.quote.net_output());
            tx.external_ref = Some(sel.quote.provider.clone());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            // Quotes carry their own expiry and provider prices move
            // continuously: re-validate immediately before every commit
            // attempt, including retries after a conflict backoff.
            if let Some(sel) = quote {
                if sel.quote.is_expired(Utc::now()) {
                    let err = CoreError::QuoteExpired {
                        provider: sel.quote.provider.clone(),
                    };
                    self.record_failure(&mut tx, &err).await;
                    return Err(err);
                }
            }

            let batch = match self.stage_batch(&tx).await {
                Ok(batch) => batch,
                Err(err) => {
                    self.record_failure(&mut tx, &err).await;
                    return Err(err);
                }
            };

            let commit = tokio::time::timeout(
                Duration::from_millis(self.cfg.commit_timeout_ms),
                self.ledger.commit(&batch),
            )
            .await;

            match commit {
                Ok(Ok(())) => {
                    return self.finish_commit(tx, batch).await;
                }
                Ok(Err(LedgerError::VersionConflict { key, expected, found }))
                    if attempt < self.cfg.max_commit_attempts =>
                {
                    warn!(tx_id = %tx.id, %key, expected, found, attempt, "version conflict, retrying");
                    self.backoff().await;
                }
                Ok(Err(e)) => {
                    let err = map_ledger_error(e, attempt);
                    self.record_failure(&mut tx, &err).await;
                    return Err(err);
                }
                Err(_) => {
                    let err = CoreError::ExecutionFailed("commit timeout".into());
                    self.record_failure(&mut tx, &err).await;
                    return Err(err);
                }
            }
        }
    }

    /// After the ledger batch lands, write the transaction row. A row
    /// write failure here compensates with the inverse batch so the
    /// ledger matches the recorded state.
    async fn finish_commit(
        &self,
        mut tx: Transaction,
        batch: LedgerBatch,
    ) -> Result<Transaction, CoreError> {
        let next = if tx.kind.is_externally_settled() {
            TxStatus::Executing
        } else {
            TxStatus::Completed
        };
        tx.status = next;
        tx.updated_at = Utc::now();

        if let Err(e) = self.txs.persist(&tx).await {
            error!(tx_id = %tx.id, error = %e, "row write failed after ledger commit, compensating");
            if let Err(inv) = self.ledger.commit(&batch.inverse()).await {
                // The ledger applied but neither the row nor the inverse
                // landed: park for operator action.
                error!(tx_id = %tx.id, error = %inv, "compensation failed");
                return Err(CoreError::ExecutionFailed(format!(
                    "row write and compensation both failed: {e}"
                )));
            }
            let err = CoreError::ExecutionFailed(e.to_string());
            // The row never durably reached its committed status.
            tx.status = TxStatus::Pending;
            self.record_failure(&mut tx, &err).await;
            return Err(err);
        }

        info!(
            tx_id = %tx.id,
            user_id = tx.user_id,
            kind = tx.kind.as_str(),
            status = %tx.status,
            amount = %tx.amount,
            "committed"
        );
        Ok(tx)
    }

    /// Stage the full ledger movement for one transaction, reading fresh
    /// account versions for the optimistic checks.
    async fn stage_batch(&self, tx: &Transaction) -> Result<LedgerBatch, CoreError> {
        let mut batch = LedgerBatch::new();
        match tx.kind {
            TxKind::Deposit => {
                batch.push(LedgerOp::Credit {
                    key: AccountKey::new(tx.user_id, &tx.pair.base),
                    amount: tx.amount,
                });
            }
            TxKind::Withdrawal => {
                let key = AccountKey::new(tx.user_id, &tx.pair.base);
                let version = self.read_version_checked(&key, tx.amount).await?;
                batch.push(LedgerOp::Reserve {
                    key,
                    amount: tx.amount,
                    expected_version: Some(version),
                });
            }
            TxKind::Swap => {
                let counter = tx.counter_amount.ok_or_else(|| {
                    CoreError::Internal("swap without a quoted counter amount".into())
                })?;
                let sell_key = AccountKey::new(tx.user_id, &tx.pair.base);
                let version = self.read_version_checked(&sell_key, tx.amount).await?;
                batch.push(LedgerOp::Debit {
                    key: sell_key,
                    amount: tx.amount,
                    expected_version: Some(version),
                });
                batch.push(LedgerOp::Credit {
                    key: AccountKey::new(tx.user_id, &tx.pair.quote),
                    amount: counter,
                });
            }
            TxKind::Trade => {
                let counter = tx.counter_amount.ok_or_else(|| {
                    CoreError::Internal("trade without a counter amount".into())
                })?;
                let (user_out_cur, user_out_amt, user_in_cur, user_in_amt) = match tx.side {
                    Some(Side::Buy) => (&tx.pair.quote, counter, &tx.pair.base, tx.amount),
                    Some(Side::Sell) => (&tx.pair.base, tx.amount, &tx.pair.quote, counter),
                    None => {
                        return Err(CoreError::Internal("trade without a side".into()));
                    }
                };
                let user_out = AccountKey::new(tx.user_id, user_out_cur);
                let version = self.read_version_checked(&user_out, user_out_amt).await?;
                batch.push(LedgerOp::Debit {
                    key: user_out,
                    amount: user_out_amt,
                    expected_version: Some(version),
                });
                batch.push(LedgerOp::Credit {
                    key: AccountKey::new(tx.user_id, user_in_cur),
                    amount: user_in_amt,
                });
                // Treasury takes the opposite side of both legs.
                batch.push(LedgerOp::Credit {
                    key: AccountKey::new(TREASURY_USER, user_out_cur),
                    amount: user_out_amt,
                });
                batch.push(LedgerOp::Debit {
                    key: AccountKey::new(TREASURY_USER, user_in_cur),
                    amount: user_in_amt,
                    expected_version: None,
                });
            }
        }
        Ok(batch)
    }

    /// Read an account's version and re-check available balance against
    /// the requested amount (protects against a race between the
    /// validator's read and this commit).
    async fn read_version_checked(
        &self,
        key: &AccountKey,
        amount: Decimal,
    ) -> Result<u64, CoreError> {
        let account = self
            .ledger
            .get(key)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        let (available, version) = account
            .map(|a| (a.available(), a.version()))
            .unwrap_or((Decimal::ZERO, 0));
        if available < amount {
            return Err(CoreError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        Ok(version)
    }

    /// Finalize an externally-settled transaction after the chain reports
    /// enough confirmations. Withdrawals capture the reservation; swaps
    /// already moved both legs at commit.
    pub async fn finalize(&self, tx_id: TxId) -> Result<Transaction, CoreError> {
        let mut tx = self.txs.get(tx_id).await?.ok_or(CoreError::NotFound(tx_id))?;
        if tx.kind == TxKind::Withdrawal {
            let mut batch = LedgerBatch::new();
            batch.push(LedgerOp::CaptureReserved {
                key: AccountKey::new(tx.user_id, &tx.pair.base),
                amount: tx.amount,
            });
            self.ledger
                .commit(&batch)
                .await
                .map_err(|e| CoreError::ExecutionFailed(e.to_string()))?;
        }
        if tx.status == TxStatus::Executing {
            tx.status = TxStatus::Completed;
            tx.updated_at = Utc::now();
            self.txs.persist(&tx).await?;
        }
        Ok(tx)
    }

    /// Mark an externally-settled transaction as surfaced-complete on
    /// first chain inclusion; funds stay reserved/moved until finality.
    pub async fn mark_confirmed(&self, tx_id: TxId) -> Result<Transaction, CoreError> {
        let mut tx = self.txs.get(tx_id).await?.ok_or(CoreError::NotFound(tx_id))?;
        if tx.status == TxStatus::Executing && tx.status.can_transition_to(TxStatus::Completed) {
            tx.status = TxStatus::Completed;
            tx.updated_at = Utc::now();
            self.txs.persist(&tx).await?;
        }
        Ok(tx)
    }

    /// Record that an external settlement never reached a terminal chain
    /// state. The reservation is NOT released: funds stay parked until an
    /// operator resolves the reconciliation item.
    pub async fn mark_confirmation_timeout(&self, tx_id: TxId) -> Result<Transaction, CoreError> {
        let mut tx = self.txs.get(tx_id).await?.ok_or(CoreError::NotFound(tx_id))?;
        if tx.status.can_transition_to(TxStatus::Failed) {
            tx.status = TxStatus::Failed;
            tx.failure_reason = Some(CoreError::ConfirmationTimeout { tx_id }.code().into());
            tx.updated_at = Utc::now();
            self.txs.persist(&tx).await?;
        }
        Ok(tx)
    }

    /// Compensating reversal after a chain reorganization. Idempotent per
    /// transaction id: a transaction already reverted is returned as-is.
    pub async fn reverse(&self, tx_id: TxId) -> Result<Transaction, CoreError> {
        let mut tx = self.txs.get(tx_id).await?.ok_or(CoreError::NotFound(tx_id))?;
        if tx.status == TxStatus::Reverted {
            return Ok(tx);
        }
        if !tx.status.can_transition_to(TxStatus::Reverted) {
            return Err(CoreError::Internal(format!(
                "cannot revert transaction in status {}",
                tx.status
            )));
        }

        let batch = self.stage_reversal(&tx)?;
        self.ledger
            .commit(&batch)
            .await
            .map_err(|e| CoreError::ExecutionFailed(e.to_string()))?;

        tx.status = TxStatus::Reverted;
        tx.failure_reason = Some("chain reorganization".into());
        tx.updated_at = Utc::now();
        self.txs.persist(&tx).await?;
        warn!(tx_id = %tx.id, user_id = tx.user_id, "transaction reverted");
        Ok(tx)
    }

    /// The exact inverse of the movement `execute` committed. Built
    /// deterministically from the row, so a reversal after restart needs
    /// no in-memory state.
    fn stage_reversal(&self, tx: &Transaction) -> Result<LedgerBatch, CoreError> {
        let mut original = LedgerBatch::new();
        match tx.kind {
            TxKind::Withdrawal => {
                original.push(LedgerOp::Reserve {
                    key: AccountKey::new(tx.user_id, &tx.pair.base),
                    amount: tx.amount,
                    expected_version: None,
                });
            }
            TxKind::Swap => {
                let counter = tx.counter_amount.ok_or_else(|| {
                    CoreError::Internal("swap row without a counter amount".into())
                })?;
                original.push(LedgerOp::Debit {
                    key: AccountKey::new(tx.user_id, &tx.pair.base),
                    amount: tx.amount,
                    expected_version: None,
                });
                original.push(LedgerOp::Credit {
                    key: AccountKey::new(tx.user_id, &tx.pair.quote),
                    amount: counter,
                });
            }
            other => {
                return Err(CoreError::Internal(format!(
                    "reversal not defined for kind {}",
                    other.as_str()
                )));
            }
        }
        Ok(original.inverse())
    }

    /// Always-successful follow-up write recording a failure, so failed
    /// commits are never silently lost. Store errors here are logged, not
    /// propagated: the original error is what the caller must see.
    async fn record_failure(&self, tx: &mut Transaction, err: &CoreError) {
        if tx.status.is_terminal() {
            return;
        }
        tx.status = TxStatus::Failed;
        tx.failure_reason = Some(format!("{}: {err}", err.code()));
        tx.updated_at = Utc::now();
        if let Err(e) = self.txs.persist(tx).await {
            error!(tx_id = %tx.id, error = %e, "failed to record failure");
        }
    }

    async fn backoff(&self) {
        let base = self.cfg.retry_backoff_ms.max(1);
        let jitter = rand::thread_rng().gen_range(0..base);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }
}

fn map_ledger_error(e: LedgerError, attempts: u32) -> CoreError {
    match e {
        LedgerError::InsufficientAvailable {
            available,
            requested,
        } => CoreError::InsufficientBalance {
            available,
            requested,
        },
        LedgerError::VersionConflict { .. } => CoreError::ConcurrencyConflict { attempts },
        LedgerError::Unavailable(msg) => CoreError::StoreUnavailable(msg),
        other => CoreError::ExecutionFailed(other.to_string()),
    }
}
