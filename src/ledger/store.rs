//! Ledger store with atomic batch commit.
//!
//! The atomic transaction manager stages every mutation of one unit of
//! work into a [`LedgerBatch`] and commits it in a single call. The store
//! validates the whole batch (balances, versions) before applying
//! anything, so a failed commit leaves every account untouched.

use super::account::{AccountKey, LedgerAccount, LedgerError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

/// One staged mutation of a single account.
#[derive(Debug, Clone)]
pub enum LedgerOp {
    /// Credit an account, creating it if absent.
    Credit { key: AccountKey, amount: Decimal },
    /// Debit an account's available balance.
    Debit {
        key: AccountKey,
        amount: Decimal,
        /// Optimistic concurrency: commit fails with `VersionConflict`
        /// if the account has moved since this version was read.
        expected_version: Option<u64>,
    },
    /// Move available funds to reserved.
    Reserve {
        key: AccountKey,
        amount: Decimal,
        expected_version: Option<u64>,
    },
    /// Move reserved funds back to available.
    Release { key: AccountKey, amount: Decimal },
    /// Settle reserved funds out of the ledger.
    CaptureReserved { key: AccountKey, amount: Decimal },
}

impl LedgerOp {
    pub fn key(&self) -> &AccountKey {
        match self {
            LedgerOp::Credit { key, .. }
            | LedgerOp::Debit { key, .. }
            | LedgerOp::Reserve { key, .. }
            | LedgerOp::Release { key, .. }
            | LedgerOp::CaptureReserved { key, .. } => key,
        }
    }
}

/// An all-or-nothing batch of ledger mutations.
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    ops: Vec<LedgerOp>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: LedgerOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[LedgerOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The deterministic inverse of this batch, used for compensating
    /// reversals. Version checks are dropped: a reversal must not fail on
    /// a version conflict, only on missing funds.
    pub fn inverse(&self) -> LedgerBatch {
        let ops = self
            .ops
            .iter()
            .rev()
            .flat_map(|op| match op {
                LedgerOp::Credit { key, amount } => vec![LedgerOp::Debit {
                    key: key.clone(),
                    amount: *amount,
                    expected_version: None,
                }],
                LedgerOp::Debit { key, amount, .. } => vec![LedgerOp::Credit {
                    key: key.clone(),
                    amount: *amount,
                }],
                LedgerOp::Reserve { key, amount, .. } => vec![LedgerOp::Release {
                    key: key.clone(),
                    amount: *amount,
                }],
                LedgerOp::Release { key, amount } => vec![LedgerOp::Reserve {
                    key: key.clone(),
                    amount: *amount,
                    expected_version: None,
                }],
                // Funds re-enter as a reservation, exactly undoing the
                // capture: credit raises balance, reserve earmarks it.
                LedgerOp::CaptureReserved { key, amount } => vec![
                    LedgerOp::Credit {
                        key: key.clone(),
                        amount: *amount,
                    },
                    LedgerOp::Reserve {
                        key: key.clone(),
                        amount: *amount,
                        expected_version: None,
                    },
                ],
            })
            .collect();
        LedgerBatch { ops }
    }
}

/// Ledger storage seam. The in-memory implementation is the default and
/// test backend; a SQL implementation can provide the same contract with
/// row-level `SELECT .. FOR UPDATE`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read one account.
    async fn get(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, LedgerError>;

    /// Atomically apply a batch: validate every op against current state
    /// (including version checks), then apply all or none.
    async fn commit(&self, batch: &LedgerBatch) -> Result<(), LedgerError>;

    /// Sum of `balance` over every account in a currency. Used by
    /// conservation checks and reconciliation.
    async fn total_balance(&self, currency: &str) -> Result<Decimal, LedgerError>;
}

/// In-memory ledger. One mutex over the whole map: batch commits are
/// serialized, which is exactly the atomicity the contract asks for.
#[derive(Default)]
pub struct MemoryLedgerStore {
    accounts: Mutex<HashMap<AccountKey, LedgerAccount>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap helper: seed an account with an opening balance.
    pub fn seed(&self, key: AccountKey, opening: Decimal) {
        let mut accounts = self.accounts.lock().unwrap();
        let mut acct = LedgerAccount::default();
        acct.credit(opening).expect("opening balance must be positive");
        accounts.insert(key, acct);
    }
}

fn apply_op(
    staged: &mut HashMap<AccountKey, LedgerAccount>,
    current: &HashMap<AccountKey, LedgerAccount>,
    op: &LedgerOp,
) -> Result<(), LedgerError> {
    let key = op.key().clone();
    let exists = staged.contains_key(&key) || current.contains_key(&key);
    if !exists && matches!(op, LedgerOp::Debit { .. } | LedgerOp::Reserve { .. }) {
        return Err(LedgerError::AccountNotFound(key.to_string()));
    }
    let entry = staged
        .entry(key.clone())
        .or_insert_with(|| current.get(&key).copied().unwrap_or_default());

    // Version checks compare against the account as it was BEFORE the
    // batch: a caller staging two ops on one account reads one version.
    if let LedgerOp::Debit {
        expected_version: Some(expected),
        ..
    }
    | LedgerOp::Reserve {
        expected_version: Some(expected),
        ..
    } = op
    {
        let found = current.get(&key).map(|a| a.version()).unwrap_or(0);
        if found != *expected {
            return Err(LedgerError::VersionConflict {
                key: key.to_string(),
                expected: *expected,
                found,
            });
        }
    }

    match op {
        LedgerOp::Credit { amount, .. } => entry.credit(*amount),
        LedgerOp::Debit { amount, .. } => entry.debit(*amount),
        LedgerOp::Reserve { amount, .. } => entry.reserve(*amount),
        LedgerOp::Release { amount, .. } => entry.release(*amount),
        LedgerOp::CaptureReserved { amount, .. } => entry.capture_reserved(*amount),
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, LedgerError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts.get(key).copied())
    }

    async fn commit(&self, batch: &LedgerBatch) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.lock().unwrap();

        // Stage every op against a copy; nothing lands until all pass.
        let mut staged: HashMap<AccountKey, LedgerAccount> = HashMap::new();
        for op in batch.ops() {
            apply_op(&mut staged, &accounts, op)?;
        }

        for (key, acct) in staged {
            accounts.insert(key, acct);
        }
        Ok(())
    }

    async fn total_balance(&self, currency: &str) -> Result<Decimal, LedgerError> {
        let currency = currency.to_uppercase();
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts
            .iter()
            .filter(|(k, _)| k.currency == currency)
            .map(|(_, a)| a.balance())
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key(user: u64, cur: &str) -> AccountKey {
        AccountKey::new(user, cur)
    }

    #[tokio::test]
    async fn test_batch_commit_applies_all() {
        let store = MemoryLedgerStore::new();
        store.seed(key(1, "USDC"), dec!(100));
        store.seed(key(0, "USDC"), dec!(1000));

        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::Debit {
            key: key(1, "USDC"),
            amount: dec!(40),
            expected_version: Some(1),
        });
        batch.push(LedgerOp::Credit {
            key: key(0, "USDC"),
            amount: dec!(40),
        });
        store.commit(&batch).await.unwrap();

        assert_eq!(store.get(&key(1, "USDC")).await.unwrap().unwrap().balance(), dec!(60));
        assert_eq!(
            store.get(&key(0, "USDC")).await.unwrap().unwrap().balance(),
            dec!(1040)
        );
    }

    #[tokio::test]
    async fn test_batch_commit_all_or_nothing() {
        let store = MemoryLedgerStore::new();
        store.seed(key(1, "USDC"), dec!(100));

        // Second op fails (insufficient funds): first op must not land.
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::Credit {
            key: key(2, "USDC"),
            amount: dec!(10),
        });
        batch.push(LedgerOp::Debit {
            key: key(1, "USDC"),
            amount: dec!(500),
            expected_version: None,
        });
        assert!(store.commit(&batch).await.is_err());

        assert!(store.get(&key(2, "USDC")).await.unwrap().is_none());
        assert_eq!(store.get(&key(1, "USDC")).await.unwrap().unwrap().balance(), dec!(100));
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let store = MemoryLedgerStore::new();
        store.seed(key(1, "ETH"), dec!(5));

        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::Debit {
            key: key(1, "ETH"),
            amount: dec!(1),
            expected_version: Some(99),
        });
        let err = store.commit(&batch).await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { .. }));
        assert_eq!(store.get(&key(1, "ETH")).await.unwrap().unwrap().balance(), dec!(5));
    }

    #[tokio::test]
    async fn test_debit_unknown_account() {
        let store = MemoryLedgerStore::new();
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::Debit {
            key: key(7, "BTC"),
            amount: dec!(1),
            expected_version: None,
        });
        let err = store.commit(&batch).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_total_balance() {
        let store = MemoryLedgerStore::new();
        store.seed(key(1, "USDC"), dec!(100));
        store.seed(key(2, "USDC"), dec!(250));
        store.seed(key(1, "ETH"), dec!(3));
        assert_eq!(store.total_balance("USDC").await.unwrap(), dec!(350));
        assert_eq!(store.total_balance("ETH").await.unwrap(), dec!(3));
    }
}
