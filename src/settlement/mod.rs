//! External Settlement Tracking
//!
//! Swaps and on-chain withdrawals settle outside the ledger. Each one
//! gets a [`SettlementRecord`] driven by the [`ConfirmationTracker`]
//! state machine until a terminal state. Records are persisted through
//! [`SettlementStore`] so tracking survives a process restart.

pub mod tracker;

pub use tracker::{ConfirmationTracker, SettlementConfig};

use crate::core_types::{ChainId, TxId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("settlement record not found: {0}")]
    NotFound(TxId),
    #[error("settlement store unavailable: {0}")]
    Unavailable(String),
    #[error("chain provider error: {0}")]
    Provider(String),
}

impl From<sqlx::Error> for SettlementError {
    fn from(e: sqlx::Error) -> Self {
        SettlementError::Unavailable(e.to_string())
    }
}

/// Per-settlement state machine.
///
/// `submitted -> pending -> confirmed -> {finalized | reverted}`, with
/// `confirmed -> reverted` as the system's only backward edge (chain
/// reorganization). Numeric ids for SQL storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum SettlementState {
    /// Accepted by the provider, no chain hash yet.
    Submitted = 0,
    /// Hash assigned, awaiting first block inclusion.
    Pending = 10,
    /// Included in a block; still subject to reorganization.
    Confirmed = 20,
    /// Enough confirmations; immutable for practical purposes.
    Finalized = 30,
    /// Removed by a reorganization; compensated.
    Reverted = -20,
    /// Never reached a terminal chain state in the allotted window.
    TimedOut = -30,
}

impl SettlementState {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SettlementState::Submitted),
            10 => Some(SettlementState::Pending),
            20 => Some(SettlementState::Confirmed),
            30 => Some(SettlementState::Finalized),
            -20 => Some(SettlementState::Reverted),
            -30 => Some(SettlementState::TimedOut),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Submitted => "SUBMITTED",
            SettlementState::Pending => "PENDING",
            SettlementState::Confirmed => "CONFIRMED",
            SettlementState::Finalized => "FINALIZED",
            SettlementState::Reverted => "REVERTED",
            SettlementState::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::Finalized | SettlementState::Reverted | SettlementState::TimedOut
        )
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chain status as reported by the read provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainTxState {
    Pending,
    Confirmed,
    Failed,
    Reverted,
}

#[derive(Debug, Clone)]
pub struct ChainTxStatus {
    pub state: ChainTxState,
    pub confirmations: u32,
    pub block_number: Option<u64>,
}

/// Read-only view of a blockchain, implemented elsewhere.
#[async_trait]
pub trait ChainReadProvider: Send + Sync {
    async fn transaction_status(
        &self,
        hash: &str,
        chain_id: ChainId,
    ) -> Result<ChainTxStatus, SettlementError>;
}

/// One tracked external settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub tx_id: TxId,
    pub chain_id: ChainId,
    pub tx_hash: Option<String>,
    pub state: SettlementState,
    pub confirmations: u32,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn new(tx_id: TxId, chain_id: ChainId, tx_hash: Option<String>) -> Self {
        let now = Utc::now();
        let state = if tx_hash.is_some() {
            SettlementState::Pending
        } else {
            SettlementState::Submitted
        };
        Self {
            tx_id,
            chain_id,
            tx_hash,
            state,
            confirmations: 0,
            registered_at: now,
            updated_at: now,
        }
    }
}

/// Settlement record persistence seam.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn upsert(&self, record: &SettlementRecord) -> Result<(), SettlementError>;

    async fn get(&self, tx_id: TxId) -> Result<Option<SettlementRecord>, SettlementError>;

    /// Every non-terminal record, for resumption after restart.
    async fn load_active(&self) -> Result<Vec<SettlementRecord>, SettlementError>;
}

#[derive(Default)]
pub struct MemorySettlementStore {
    records: DashMap<TxId, SettlementRecord>,
}

impl MemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for MemorySettlementStore {
    async fn upsert(&self, record: &SettlementRecord) -> Result<(), SettlementError> {
        self.records.insert(record.tx_id, record.clone());
        Ok(())
    }

    async fn get(&self, tx_id: TxId) -> Result<Option<SettlementRecord>, SettlementError> {
        Ok(self.records.get(&tx_id).map(|r| r.clone()))
    }

    async fn load_active(&self) -> Result<Vec<SettlementRecord>, SettlementError> {
        Ok(self
            .records
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.clone())
            .collect())
    }
}

/// Why a transaction was parked for operator attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationCause {
    ConfirmationTimeout,
    ReversalFailed,
}

#[derive(Debug, Clone)]
pub struct ReconciliationItem {
    pub tx_id: TxId,
    pub cause: ReconciliationCause,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Manual-intervention queue. Settlements that cannot be resolved
/// automatically land here instead of being guessed at; funds stay
/// reserved until an operator acts.
#[derive(Default)]
pub struct ReconciliationQueue {
    items: Mutex<Vec<ReconciliationItem>>,
}

impl ReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx_id: TxId, cause: ReconciliationCause, detail: impl Into<String>) {
        let item = ReconciliationItem {
            tx_id,
            cause,
            detail: detail.into(),
            at: Utc::now(),
        };
        tracing::error!(tx_id = %item.tx_id, cause = ?item.cause, detail = %item.detail, "parked for manual reconciliation");
        self.items.lock().unwrap().push(item);
    }

    pub fn drain(&self) -> Vec<ReconciliationItem> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_id_roundtrip() {
        for state in [
            SettlementState::Submitted,
            SettlementState::Pending,
            SettlementState::Confirmed,
            SettlementState::Finalized,
            SettlementState::Reverted,
            SettlementState::TimedOut,
        ] {
            assert_eq!(SettlementState::from_id(state.id()), Some(state));
        }
        assert!(SettlementState::from_id(7).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SettlementState::Finalized.is_terminal());
        assert!(SettlementState::Reverted.is_terminal());
        assert!(SettlementState::TimedOut.is_terminal());
        assert!(!SettlementState::Confirmed.is_terminal());
    }

    #[tokio::test]
    async fn test_load_active_skips_terminal() {
        let store = MemorySettlementStore::new();
        let mut a = SettlementRecord::new(uuid::Uuid::new_v4(), 1, Some("0xaa".into()));
        let mut b = SettlementRecord::new(uuid::Uuid::new_v4(), 1, Some("0xbb".into()));
        b.state = SettlementState::Finalized;
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tx_id, a.tx_id);

        a.state = SettlementState::Reverted;
        store.upsert(&a).await.unwrap();
        assert!(store.load_active().await.unwrap().is_empty());
    }
}
