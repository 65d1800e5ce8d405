//! Terminal-state notification events.
//!
//! Fire-and-forget: the core spawns the dispatch and never waits on it.
//! Delivery (email/SMS/push) is another system's problem.

use crate::core_types::{TxId, UserId};
use crate::transaction::{Transaction, TxKind, TxStatus};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxNotification {
    pub tx_id: TxId,
    pub user_id: UserId,
    pub kind: TxKind,
    pub status: TxStatus,
    pub amount: Decimal,
    pub failure_reason: Option<String>,
}

impl TxNotification {
    pub fn from_tx(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.id,
            user_id: tx.user_id,
            kind: tx.kind,
            status: tx.status,
            amount: tx.amount,
            failure_reason: tx.failure_reason.clone(),
        }
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, event: TxNotification);
}

/// Default dispatcher: a structured log line per event.
#[derive(Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, event: TxNotification) {
        info!(
            tx_id = %event.tx_id,
            user_id = event.user_id,
            kind = event.kind.as_str(),
            status = event.status.as_str(),
            amount = %event.amount,
            "transaction notification"
        );
    }
}
