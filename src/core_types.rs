//! Core types used throughout the system
//!
//! These are fundamental type aliases and small value types used by all
//! modules. They provide semantic meaning and enable future type evolution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User ID - globally unique, immutable after assignment.
pub type UserId = u64;

/// Chain ID - EVM-style numeric chain identifier (1 = mainnet, etc).
pub type ChainId = u32;

/// Transaction ID - unique across the whole core.
pub type TxId = uuid::Uuid;

/// The ledger account held by the system itself.
///
/// Internal trades and swaps settle double-entry against this account so
/// that every internal movement conserves the total of each currency.
pub const TREASURY_USER: UserId = 0;

/// A currency pair such as `ETH/USDC`.
///
/// Single-currency operations (deposits, withdrawals) use a degenerate
/// pair where `base == quote`; `Display` renders those as the bare symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }

    /// Degenerate pair for single-currency operations.
    pub fn single(currency: &str) -> Self {
        Self::new(currency, currency)
    }

    /// Parse `"ETH/USDC"` or a bare symbol like `"BTC"`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        match s.split_once('/') {
            Some((base, quote)) => {
                if base.is_empty() || quote.is_empty() {
                    return None;
                }
                Some(Self::new(base, quote))
            }
            None => Some(Self::single(s)),
        }
    }

    pub fn is_single(&self) -> bool {
        self.base == self.quote
    }

    /// Symbol format check used by the safety validator: non-empty
    /// alphanumeric legs, bounded length.
    pub fn is_well_formed(&self, max_len: usize) -> bool {
        let leg_ok = |leg: &str| {
            !leg.is_empty() && leg.len() <= max_len && leg.chars().all(|c| c.is_ascii_alphanumeric())
        };
        leg_ok(&self.base) && leg_ok(&self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.base)
        } else {
            write!(f, "{}/{}", self.base, self.quote)
        }
    }
}
