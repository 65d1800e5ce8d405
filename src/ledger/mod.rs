//! Internal Ledger
//!
//! One [`LedgerAccount`] per (user, currency). All mutations go through
//! the [`LedgerStore`] as atomic batches with optimistic version checks;
//! nothing outside the atomic transaction manager should ever write here.
//!
//! # Invariants
//!
//! - `available() + reserved == balance` by construction
//! - `available() >= 0` and `reserved >= 0` at all times
//! - `version` increments on every mutation (optimistic concurrency)

pub mod account;
pub mod store;

pub use account::{AccountKey, LedgerAccount, LedgerError};
pub use store::{LedgerBatch, LedgerOp, LedgerStore, MemoryLedgerStore};
