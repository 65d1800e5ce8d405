//! Concurrent quote fan-out and winner selection.

use super::{ProviderRegistry, Quote, QuoteRequest, SelectedQuote};
use crate::error::CoreError;
use futures::stream::{FuturesUnordered, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    /// Shared deadline for the whole fan-out.
    pub max_wait_ms: u64,
    /// Impact above this fraction makes a quote unselectable.
    pub discard_impact: Decimal,
    /// Impact above this fraction flags the quote for a caller warning.
    pub flag_impact: Decimal,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 3_000,
            discard_impact: Decimal::new(5, 2), // 5%
            flag_impact: Decimal::new(1, 2),    // 1%
        }
    }
}

pub struct QuoteOrchestrator {
    registry: ProviderRegistry,
    cfg: QuoteConfig,
}

impl QuoteOrchestrator {
    pub fn new(registry: ProviderRegistry, cfg: QuoteConfig) -> Self {
        Self { registry, cfg }
    }

    /// Query every registered provider under one shared deadline and pick
    /// the quote maximizing net output, ties broken by lowest impact.
    ///
    /// Providers that error or miss the deadline are excluded, never
    /// retried synchronously; their futures are dropped, not awaited, so
    /// caller latency is never coupled to the slowest vendor.
    pub async fn best_quote(&self, req: &QuoteRequest) -> Result<SelectedQuote, CoreError> {
        let providers = self.registry.snapshot();
        if providers.is_empty() {
            return Err(CoreError::NoQuoteAvailable);
        }

        let mut pending: FuturesUnordered<_> = providers
            .iter()
            .map(|p| {
                let p = p.clone();
                let req = req.clone();
                async move {
                    let name = p.name().to_string();
                    (name, p.quote(&req).await)
                }
            })
            .collect();

        let deadline = tokio::time::sleep(Duration::from_millis(self.cfg.max_wait_ms));
        tokio::pin!(deadline);

        let mut usable: Vec<Quote> = Vec::with_capacity(providers.len());
        let mut outstanding = providers.len();
        while outstanding > 0 {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(outstanding, "quote deadline reached, abandoning stragglers");
                    break;
                }
                Some((name, result)) = pending.next() => {
                    outstanding -= 1;
                    match result {
                        Ok(quote) => {
                            if quote.price_impact > self.cfg.discard_impact {
                                warn!(provider = %name, impact = %quote.price_impact, "quote discarded for impact");
                            } else {
                                usable.push(quote);
                            }
                        }
                        Err(e) => {
                            warn!(provider = %name, error = %e, "provider excluded");
                        }
                    }
                }
            }
        }

        let compared = usable.len();
        let winner = usable
            .into_iter()
            .max_by(|a, b| {
                a.net_output()
                    .cmp(&b.net_output())
                    // Reversed: a LOWER impact wins the tie.
                    .then_with(|| b.price_impact.cmp(&a.price_impact))
            })
            .ok_or(CoreError::NoQuoteAvailable)?;

        let flagged = winner.price_impact > self.cfg.flag_impact;
        debug!(
            provider = %winner.provider,
            net_output = %winner.net_output(),
            impact = %winner.price_impact,
            compared,
            flagged,
            "quote selected"
        );
        Ok(SelectedQuote {
            quote: winner,
            flagged,
            compared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::CurrencyPair;
    use crate::quotes::mock::MockProvider;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn req() -> QuoteRequest {
        QuoteRequest {
            pair: CurrencyPair::new("ETH", "USDC"),
            amount: dec!(50),
            chain_id: 1,
        }
    }

    fn orchestrator(providers: Vec<MockProvider>, max_wait_ms: u64) -> QuoteOrchestrator {
        let registry = ProviderRegistry::new();
        for p in providers {
            registry.register(Arc::new(p));
        }
        QuoteOrchestrator::new(
            registry,
            QuoteConfig {
                max_wait_ms,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_selects_highest_net_output() {
        let orch = orchestrator(
            vec![
                MockProvider::returning("a", dec!(98)),
                MockProvider::returning("b", dec!(101)),
                MockProvider::returning("c", dec!(99)),
            ],
            1000,
        );
        let selected = orch.best_quote(&req()).await.unwrap();
        assert_eq!(selected.quote.provider, "b");
        assert_eq!(selected.compared, 3);
        assert!(!selected.flagged);
    }

    #[tokio::test]
    async fn test_timed_out_provider_excluded() {
        let orch = orchestrator(
            vec![
                MockProvider::returning("slow", dec!(200))
                    .with_delay(StdDuration::from_secs(10)),
                MockProvider::returning("a", dec!(49)),
                MockProvider::returning("b", dec!(49.50)),
            ],
            100,
        );
        let selected = orch.best_quote(&req()).await.unwrap();
        assert_eq!(selected.quote.provider, "b");
        assert_eq!(selected.compared, 2);
    }

    #[tokio::test]
    async fn test_erroring_provider_excluded() {
        let orch = orchestrator(
            vec![
                MockProvider::returning("bad", dec!(999)).failing(),
                MockProvider::returning("ok", dec!(50)),
            ],
            1000,
        );
        let selected = orch.best_quote(&req()).await.unwrap();
        assert_eq!(selected.quote.provider, "ok");
    }

    #[tokio::test]
    async fn test_high_impact_never_selectable() {
        let orch = orchestrator(
            vec![
                MockProvider::returning("whale", dec!(110)).with_impact(dec!(0.06)),
                MockProvider::returning("ok", dec!(100)).with_impact(dec!(0.002)),
            ],
            1000,
        );
        let selected = orch.best_quote(&req()).await.unwrap();
        assert_eq!(selected.quote.provider, "ok");
    }

    #[tokio::test]
    async fn test_moderate_impact_flagged() {
        let orch = orchestrator(
            vec![MockProvider::returning("a", dec!(100)).with_impact(dec!(0.03))],
            1000,
        );
        let selected = orch.best_quote(&req()).await.unwrap();
        assert!(selected.flagged);
    }

    #[tokio::test]
    async fn test_tie_broken_by_lowest_impact() {
        let orch = orchestrator(
            vec![
                MockProvider::returning("high_impact", dec!(100)).with_impact(dec!(0.04)),
                MockProvider::returning("low_impact", dec!(100)).with_impact(dec!(0.01)),
            ],
            1000,
        );
        let selected = orch.best_quote(&req()).await.unwrap();
        assert_eq!(selected.quote.provider, "low_impact");
    }

    #[tokio::test]
    async fn test_all_failed_is_no_quote() {
        let orch = orchestrator(
            vec![
                MockProvider::returning("a", dec!(1)).failing(),
                MockProvider::returning("b", dec!(1)).failing(),
            ],
            1000,
        );
        let err = orch.best_quote(&req()).await.unwrap_err();
        assert!(matches!(err, CoreError::NoQuoteAvailable));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_registry_is_no_quote() {
        let orch = orchestrator(vec![], 1000);
        assert!(matches!(
            orch.best_quote(&req()).await.unwrap_err(),
            CoreError::NoQuoteAvailable
        ));
    }
}
