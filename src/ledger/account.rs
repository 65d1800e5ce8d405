//! Enforced ledger account type.
//!
//! Fields are private: every mutation is a validated method that returns
//! `Result`, keeps the reserve invariant, and bumps the version. The type
//! system prevents bypassing validation.

use crate::core_types::UserId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ledger-level errors. Converted to [`crate::error::CoreError`] at the
/// executor boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient available balance: available {available}, requested {requested}")]
    InsufficientAvailable {
        available: Decimal,
        requested: Decimal,
    },

    #[error("insufficient reserved balance: reserved {reserved}, requested {requested}")]
    InsufficientReserved {
        reserved: Decimal,
        requested: Decimal,
    },

    #[error("amount must be positive: {0}")]
    NonPositiveAmount(Decimal),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("ledger store unavailable: {0}")]
    Unavailable(String),
}

/// Key identifying one ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub user_id: UserId,
    pub currency: String,
}

impl AccountKey {
    pub fn new(user_id: UserId, currency: &str) -> Self {
        Self {
            user_id,
            currency: currency.to_uppercase(),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.currency)
    }
}

/// Balance of one (user, currency) account.
///
/// `balance` is the total; `reserved` is earmarked for in-flight external
/// settlements; `available() = balance - reserved` is what new operations
/// may spend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    balance: Decimal,
    reserved: Decimal,
    version: u64,
}

impl LedgerAccount {
    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    #[inline]
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    #[inline]
    pub fn reserved(&self) -> Decimal {
        self.reserved
    }

    #[inline]
    pub fn available(&self) -> Decimal {
        self.balance - self.reserved
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    // ============================================================
    // VALIDATED MUTATIONS
    // ============================================================

    fn require_positive(amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        Ok(())
    }

    /// Add funds to the available balance.
    pub fn credit(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        self.balance += amount;
        self.version += 1;
        Ok(())
    }

    /// Remove funds from the available balance.
    pub fn debit(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        if self.available() < amount {
            return Err(LedgerError::InsufficientAvailable {
                available: self.available(),
                requested: amount,
            });
        }
        self.balance -= amount;
        self.version += 1;
        Ok(())
    }

    /// Earmark available funds for an in-flight external settlement.
    pub fn reserve(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        if self.available() < amount {
            return Err(LedgerError::InsufficientAvailable {
                available: self.available(),
                requested: amount,
            });
        }
        self.reserved += amount;
        self.version += 1;
        Ok(())
    }

    /// Return reserved funds to the available balance (failed or reverted
    /// settlement).
    pub fn release(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        if self.reserved < amount {
            return Err(LedgerError::InsufficientReserved {
                reserved: self.reserved,
                requested: amount,
            });
        }
        self.reserved -= amount;
        self.version += 1;
        Ok(())
    }

    /// Settle reserved funds out of the ledger (finalized external
    /// settlement): funds leave both `reserved` and `balance`.
    pub fn capture_reserved(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        if self.reserved < amount {
            return Err(LedgerError::InsufficientReserved {
                reserved: self.reserved,
                requested: amount,
            });
        }
        self.reserved -= amount;
        self.balance -= amount;
        self.version += 1;
        Ok(())
    }
}
