//! Transaction Model
//!
//! Immutable intent plus mutable outcome. Status transitions are
//! one-directional with a single allowed backward edge
//! (`Completed -> Reverted`, driven by the confirmation tracker after a
//! chain reorganization). Numeric status IDs are designed for SQL storage
//! as SMALLINT.

use crate::core_types::{ChainId, CurrencyPair, TxId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TxKind {
    Trade = 1,
    Deposit = 2,
    Withdrawal = 3,
    Swap = 4,
}

impl TxKind {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TxKind::Trade),
            2 => Some(TxKind::Deposit),
            3 => Some(TxKind::Withdrawal),
            4 => Some(TxKind::Swap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Trade => "TRADE",
            TxKind::Deposit => "DEPOSIT",
            TxKind::Withdrawal => "WITHDRAWAL",
            TxKind::Swap => "SWAP",
        }
    }

    /// Whether this kind settles outside the internal ledger and is
    /// followed by the confirmation tracker.
    pub fn is_externally_settled(&self) -> bool {
        matches!(self, TxKind::Withdrawal | TxKind::Swap)
    }
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Transaction status.
///
/// Terminal states: `Completed` is terminal for the caller but may still
/// move to `Reverted` through the tracker's backward edge; `Failed` and
/// `Reverted` are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TxStatus {
    /// Created by the execution coordinator, not yet committed.
    Pending = 0,
    /// Ledger mutations committed, external settlement still in flight.
    Executing = 10,
    /// Terminal for the caller; tracker may still revert.
    Completed = 20,
    /// Terminal: nothing was applied (or everything was rolled back).
    Failed = -10,
    /// Terminal: committed, then reversed after a chain reorganization.
    Reverted = -20,
}

impl TxStatus {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TxStatus::Pending),
            10 => Some(TxStatus::Executing),
            20 => Some(TxStatus::Completed),
            -10 => Some(TxStatus::Failed),
            -20 => Some(TxStatus::Reverted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Executing => "EXECUTING",
            TxStatus::Completed => "COMPLETED",
            TxStatus::Failed => "FAILED",
            TxStatus::Reverted => "REVERTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::Completed | TxStatus::Failed | TxStatus::Reverted
        )
    }

    /// The enforced transition table. Everything is one-directional except
    /// the explicit `Completed -> Reverted` edge.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Reverted)
                | (Completed, Reverted)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A money-moving operation tracked by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub user_id: UserId,
    pub kind: TxKind,
    pub side: Option<Side>,
    pub pair: CurrencyPair,
    pub amount: Decimal,
    /// Quote-leg amount actually credited (trades and swaps).
    pub counter_amount: Option<Decimal>,
    /// Caller-supplied limit price, sanity-checked during validation.
    pub limit_price: Option<Decimal>,
    pub chain_id: Option<ChainId>,
    pub status: TxStatus,
    /// Aggregator id or chain transaction hash.
    pub external_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: UserId,
        kind: TxKind,
        side: Option<Side>,
        pair: CurrencyPair,
        amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            kind,
            side,
            pair,
            amount,
            counter_amount: None,
            limit_price: None,
            chain_id: None,
            status: TxStatus::Pending,
            external_ref: None,
            idempotency_key: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this operation debits the user before anything else
    /// (sell-side trades, withdrawals, swaps).
    pub fn is_debit(&self) -> bool {
        match self.kind {
            TxKind::Withdrawal | TxKind::Swap => true,
            TxKind::Trade => self.side == Some(Side::Sell),
            TxKind::Deposit => false,
        }
    }

    /// Currency debited from the user, if any.
    pub fn debit_currency(&self) -> Option<&str> {
        match self.kind {
            TxKind::Withdrawal | TxKind::Swap => Some(&self.pair.base),
            TxKind::Trade => match self.side {
                Some(Side::Sell) => Some(&self.pair.base),
                Some(Side::Buy) => Some(&self.pair.quote),
                None => None,
            },
            TxKind::Deposit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_id_roundtrip() {
        for status in [
            TxStatus::Pending,
            TxStatus::Executing,
            TxStatus::Completed,
            TxStatus::Failed,
            TxStatus::Reverted,
        ] {
            assert_eq!(TxStatus::from_id(status.id()), Some(status));
        }
        assert!(TxStatus::from_id(99).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TxStatus::Completed.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
        assert!(TxStatus::Reverted.is_terminal());
        assert!(!TxStatus::Pending.is_terminal());
        assert!(!TxStatus::Executing.is_terminal());
    }

    #[test]
    fn test_one_directional_transitions() {
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Executing));
        assert!(TxStatus::Executing.can_transition_to(TxStatus::Completed));
        assert!(TxStatus::Completed.can_transition_to(TxStatus::Reverted));

        // No re-entry into or out of terminal states other than the
        // single reorg edge.
        assert!(!TxStatus::Completed.can_transition_to(TxStatus::Executing));
        assert!(!TxStatus::Failed.can_transition_to(TxStatus::Pending));
        assert!(!TxStatus::Reverted.can_transition_to(TxStatus::Completed));
        assert!(!TxStatus::Executing.can_transition_to(TxStatus::Pending));
    }

    #[test]
    fn test_debit_classification() {
        let sell = Transaction::new(
            1,
            TxKind::Trade,
            Some(Side::Sell),
            CurrencyPair::new("ETH", "USDC"),
            dec!(1),
        );
        assert!(sell.is_debit());
        assert_eq!(sell.debit_currency(), Some("ETH"));

        let buy = Transaction::new(
            1,
            TxKind::Trade,
            Some(Side::Buy),
            CurrencyPair::new("ETH", "USDC"),
            dec!(1),
        );
        assert!(!buy.is_debit());
        assert_eq!(buy.debit_currency(), Some("USDC"));

        let deposit = Transaction::new(1, TxKind::Deposit, None, CurrencyPair::single("BTC"), dec!(1));
        assert!(!deposit.is_debit());
        assert_eq!(deposit.debit_currency(), None);

        let swap = Transaction::new(
            1,
            TxKind::Swap,
            None,
            CurrencyPair::new("ETH", "USDC"),
            dec!(1),
        );
        assert!(swap.is_debit());
        assert!(swap.kind.is_externally_settled());
    }
}
