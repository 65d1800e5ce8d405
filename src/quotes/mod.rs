//! Quote Aggregation
//!
//! Swap pricing comes from N independent external providers with
//! conflicting answers and unpredictable latency. The orchestrator fans
//! out to every registered provider under one shared deadline and selects
//! a winner; providers that error or miss the deadline are simply absent
//! from consideration.
//!
//! The provider set is configuration-driven and may change at runtime:
//! vendors are a polymorphic [`QuoteProvider`] capability behind a
//! [`ProviderRegistry`], never hard-coded branches.

pub mod orchestrator;

pub use orchestrator::QuoteOrchestrator;

use crate::core_types::{ChainId, CurrencyPair};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("pair not supported: {0}")]
    Unsupported(CurrencyPair),
}

/// A single provider's answer. Ephemeral: consumed once by the executor
/// and discarded after execution or expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub provider: String,
    pub price: Decimal,
    /// Estimated output amount before fees.
    pub buy_amount: Decimal,
    pub fee: Decimal,
    /// Fractional price impact of the trade's own size (0.06 = 6%).
    pub price_impact: Decimal,
    pub expires_at: DateTime<Utc>,
    /// Raw provider payload, kept for audit.
    pub raw: serde_json::Value,
}

impl Quote {
    /// Output net of the provider's fee: the selection criterion.
    pub fn net_output(&self) -> Decimal {
        self.buy_amount - self.fee
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What the caller asked to swap.
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub pair: CurrencyPair,
    pub amount: Decimal,
    pub chain_id: ChainId,
}

/// The orchestrator's pick, with its warning flag.
#[derive(Debug, Clone)]
pub struct SelectedQuote {
    pub quote: Quote,
    /// Impact between the flag and discard thresholds: selectable, but
    /// the coordinator surfaces a warning before commit.
    pub flagged: bool,
    /// Number of usable quotes the winner was chosen from.
    pub compared: usize,
}

/// External quote vendor capability.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn quote(&self, req: &QuoteRequest) -> Result<Quote, QuoteError>;
}

/// Runtime-mutable set of providers.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn QuoteProvider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn QuoteProvider>) {
        self.providers.write().unwrap().push(provider);
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn QuoteProvider>> {
        self.providers.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    /// Scriptable provider: fixed net output, optional latency, optional
    /// failure.
    pub struct MockProvider {
        pub name: String,
        pub buy_amount: Decimal,
        pub fee: Decimal,
        pub price_impact: Decimal,
        pub delay: StdDuration,
        pub fail: bool,
        pub ttl_secs: i64,
    }

    impl MockProvider {
        pub fn returning(name: &str, buy_amount: Decimal) -> Self {
            Self {
                name: name.to_string(),
                buy_amount,
                fee: Decimal::ZERO,
                price_impact: Decimal::ZERO,
                delay: StdDuration::ZERO,
                fail: false,
                ttl_secs: 30,
            }
        }

        pub fn with_impact(mut self, impact: Decimal) -> Self {
            self.price_impact = impact;
            self
        }

        pub fn with_delay(mut self, delay: StdDuration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn with_ttl_secs(mut self, secs: i64) -> Self {
            self.ttl_secs = secs;
            self
        }
    }

    #[async_trait]
    impl QuoteProvider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn quote(&self, req: &QuoteRequest) -> Result<Quote, QuoteError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(QuoteError::Provider("scripted failure".into()));
            }
            Ok(Quote {
                provider: self.name.clone(),
                price: if req.amount.is_zero() {
                    Decimal::ZERO
                } else {
                    self.buy_amount / req.amount
                },
                buy_amount: self.buy_amount,
                fee: self.fee,
                price_impact: self.price_impact,
                expires_at: Utc::now() + Duration::seconds(self.ttl_secs),
                raw: serde_json::json!({ "provider": self.name }),
            })
        }
    }
}
