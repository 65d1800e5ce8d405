//! Per-user rolling risk aggregates.

use crate::core_types::{TxId, UserId};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One recorded transaction, kept while inside the 24h window.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    at: DateTime<Utc>,
    amount: Decimal,
}

/// Rolling aggregates for one user.
///
/// The trailing mean/variance run over everything ever recorded (Welford's
/// online update), while count/volume windows prune to 1h and 24h. The
/// `applied` map makes terminal-outcome updates idempotent per transaction
/// id within the 24h window: a transaction recorded twice counts once, and
/// ids age out with their stamps so the map stays bounded.
#[derive(Debug, Default, Clone)]
pub struct RiskProfile {
    recent: VecDeque<Stamp>,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    applied: HashMap<TxId, DateTime<Utc>>,
    mean: f64,
    m2: f64,
    samples: u64,
}

impl RiskProfile {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(24);
        while let Some(front) = self.recent.front() {
            if front.at < cutoff {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.applied.retain(|_, at| *at >= cutoff);
    }

    /// Transactions recorded in the trailing hour.
    pub fn hourly_count(&self, now: DateTime<Utc>) -> u32 {
        let cutoff = now - Duration::hours(1);
        self.recent.iter().filter(|s| s.at >= cutoff).count() as u32
    }

    /// Total volume recorded in the trailing 24 hours.
    pub fn daily_volume(&self, now: DateTime<Utc>) -> Decimal {
        let cutoff = now - Duration::hours(24);
        self.recent
            .iter()
            .filter(|s| s.at >= cutoff)
            .map(|s| s.amount)
            .sum()
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Trailing mean transaction amount.
    pub fn mean_amount(&self) -> f64 {
        self.mean
    }

    /// Trailing standard deviation of transaction amounts.
    pub fn stddev_amount(&self) -> f64 {
        if self.samples < 2 {
            return 0.0;
        }
        (self.m2 / (self.samples - 1) as f64).sqrt()
    }

    /// Record a terminal outcome for a transaction. Idempotent per
    /// transaction id.
    pub fn record_outcome(
        &mut self,
        tx_id: TxId,
        amount: Decimal,
        success: bool,
        now: DateTime<Utc>,
    ) {
        if self.applied.contains_key(&tx_id) {
            return;
        }
        self.prune(now);
        self.applied.insert(tx_id, now);
        self.recent.push_back(Stamp { at: now, amount });

        // Welford's online mean/variance.
        let x = amount.to_f64().unwrap_or(0.0);
        self.samples += 1;
        let delta = x - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (x - self.mean);

        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.last_failure_at = Some(now);
        }
    }
}

/// Shared in-memory profile store. Eventual consistency is acceptable
/// here: profiles feed a heuristic, hard limits are re-checked against
/// the authoritative ledger at commit time.
#[derive(Default, Clone)]
pub struct ProfileStore {
    profiles: Arc<DashMap<UserId, RiskProfile>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, user_id: UserId) -> RiskProfile {
        self.profiles
            .get(&user_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn record_outcome(
        &self,
        user_id: UserId,
        tx_id: TxId,
        amount: Decimal,
        success: bool,
        now: DateTime<Utc>,
    ) {
        self.profiles
            .entry(user_id)
            .or_default()
            .record_outcome(tx_id, amount, success, now);
    }
}
