//! clearcore - Financial Transaction Safety and Execution Core
//!
//! Validates, atomically commits, and tracks the lifecycle of
//! money-moving operations (trades, deposits, withdrawals, DEX swaps)
//! across one internal ledger and several external, eventually-consistent
//! systems.
//!
//! # Modules
//!
//! - [`core_types`] - Core type definitions (UserId, TxId, CurrencyPair)
//! - [`error`] - One error taxonomy with stable codes
//! - [`transaction`] - Transaction model and status state machine
//! - [`ledger`] - Enforced accounts with atomic batch commit
//! - [`idempotency`] - Duplicate-submission defense
//! - [`risk`] - Per-user aggregates and the pure risk scorer
//! - [`safety`] - Short-circuiting pre-commit validation
//! - [`quotes`] - Concurrent quote fan-out and selection
//! - [`executor`] - All-or-nothing commit with compensating reversal
//! - [`settlement`] - Chain confirmation tracking (the saga's second half)
//! - [`coordinator`] - The single entry point with mutation authority
//! - [`persistence`] - PostgreSQL-backed stores

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod persistence;
pub mod quotes;
pub mod risk;
pub mod safety;
pub mod settlement;
pub mod transaction;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use coordinator::{ExecutionCoordinator, ExecutionOutcome, ExecutionRequest, SubmitResult};
pub use core_types::{ChainId, CurrencyPair, TxId, UserId, TREASURY_USER};
pub use error::CoreError;
pub use executor::{AtomicTransactionManager, MemoryTransactionStore, TransactionStore};
pub use idempotency::{Begin, IdempotencyStore, MemoryIdempotencyStore, StoredResult};
pub use ledger::{AccountKey, LedgerAccount, LedgerBatch, LedgerOp, LedgerStore, MemoryLedgerStore};
pub use notify::{LogDispatcher, NotificationDispatcher, TxNotification};
pub use quotes::{
    ProviderRegistry, Quote, QuoteOrchestrator, QuoteProvider, QuoteRequest, SelectedQuote,
};
pub use risk::{ProfileStore, RiskProfile};
pub use safety::{AccountStatus, AccountStatusProvider, RejectReason, SafetyValidator};
pub use settlement::{
    ChainReadProvider, ChainTxState, ChainTxStatus, ConfirmationTracker, MemorySettlementStore,
    ReconciliationQueue, SettlementRecord, SettlementState, SettlementStore,
};
pub use transaction::{Side, Transaction, TxKind, TxStatus};
