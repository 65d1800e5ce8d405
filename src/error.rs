//! Core Error Types
//!
//! One taxonomy for the whole execution core. Callers match on stable
//! codes, not on enum variant names.

use crate::core_types::TxId;
use crate::safety::RejectReason;
use rust_decimal::Decimal;
use thiserror::Error;

/// Execution core error taxonomy.
///
/// Every variant maps to a stable code for API responses, and to a
/// retryability class: rejections are permanent until the caller changes
/// the request, transient kinds are safe to retry.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // === Pre-commit rejections (synchronous, never auto-retried) ===
    #[error("validation rejected: {reason}")]
    ValidationRejected { reason: RejectReason },

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("risk score {score:.3} at or over threshold {threshold:.3}")]
    RiskRejected { score: f64, threshold: f64 },

    // === Transient failures (safe to retry) ===
    #[error("no usable quote from any provider before the deadline")]
    NoQuoteAvailable,

    #[error("quote from {provider} expired before commit")]
    QuoteExpired { provider: String },

    #[error("ledger version conflict persisted after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    // === Commit / settlement failures (durably recorded first) ===
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("confirmation timeout for transaction {tx_id}")]
    ConfirmationTimeout { tx_id: TxId },

    #[error("transaction {tx_id} reverted by chain reorganization")]
    Reverted { tx_id: TxId },

    // === System errors ===
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("transaction not found: {0}")]
    NotFound(TxId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ValidationRejected { .. } => "VALIDATION_REJECTED",
            CoreError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CoreError::RiskRejected { .. } => "RISK_REJECTED",
            CoreError::NoQuoteAvailable => "NO_QUOTE_AVAILABLE",
            CoreError::QuoteExpired { .. } => "QUOTE_EXPIRED",
            CoreError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            CoreError::ExecutionFailed(_) => "EXECUTION_FAILED",
            CoreError::ConfirmationTimeout { .. } => "CONFIRMATION_TIMEOUT",
            CoreError::Reverted { .. } => "REVERTED",
            CoreError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the caller may safely retry the same logical request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::NoQuoteAvailable
                | CoreError::QuoteExpired { .. }
                | CoreError::ConcurrencyConflict { .. }
                | CoreError::StoreUnavailable(_)
        )
    }

    /// HTTP status code suggestion for the out-of-scope request layer.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::ValidationRejected { .. } => 400,
            CoreError::InsufficientBalance { .. } | CoreError::RiskRejected { .. } => 422,
            CoreError::NoQuoteAvailable
                | CoreError::QuoteExpired { .. }
                | CoreError::ConcurrencyConflict { .. } => 409,
            CoreError::ExecutionFailed(_)
                | CoreError::ConfirmationTimeout { .. }
                | CoreError::Reverted { .. }
                | CoreError::Internal(_) => 500,
            CoreError::StoreUnavailable(_) => 503,
            CoreError::NotFound(_) => 404,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::StoreUnavailable(e.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}
