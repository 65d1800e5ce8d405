//! Risk score computation.
//!
//! Pure function over a profile snapshot and a proposed transaction: no
//! I/O, no clocks of its own, so it is safe to call inline on the request
//! path and trivial to test.

use super::profile::RiskProfile;
use crate::transaction::Transaction;
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type RiskScore = f64;

/// Scoring weights and thresholds. Velocity caps live here rather than in
/// the safety limits because a cap breach is a hard score of 1.0, not an
/// additive signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_hourly_count: u32,
    pub max_daily_volume: Decimal,
    /// z-score above which the amount counts as anomalous.
    pub zscore_threshold: f64,
    pub amount_anomaly_weight: f64,
    /// Fractional deviation from the trailing mean that counts as a
    /// behavioral anomaly (0.5 = 50%).
    pub behavioral_deviation: f64,
    pub behavioral_weight: f64,
    /// UTC hour range [start, end) treated as unusual; may wrap midnight
    /// (start 22, end 2 covers 22:00-02:00).
    pub unusual_hours_start: u32,
    pub unusual_hours_end: u32,
    pub unusual_hours_weight: f64,
    /// Scores at or above this are rejected by the safety validator.
    pub reject_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_hourly_count: 100,
            max_daily_volume: Decimal::from(10_000_000u64),
            zscore_threshold: 3.0,
            amount_anomaly_weight: 0.2,
            behavioral_deviation: 0.5,
            behavioral_weight: 0.25,
            unusual_hours_start: 2,
            unusual_hours_end: 5,
            unusual_hours_weight: 0.1,
            reject_threshold: 0.7,
        }
    }
}

/// Compute the risk score for a proposed transaction.
///
/// A velocity cap breach is a hard 1.0. Otherwise additive signals
/// (amount anomaly, behavioral deviation, unusual hours) sum and cap
/// at 1.0.
pub fn score(
    proposed: &Transaction,
    profile: &RiskProfile,
    cfg: &RiskConfig,
    now: DateTime<Utc>,
) -> RiskScore {
    // Velocity: would this transaction push the user over a cap?
    if profile.hourly_count(now) + 1 > cfg.max_hourly_count
        || profile.daily_volume(now) + proposed.amount > cfg.max_daily_volume
    {
        return 1.0;
    }

    let mut total = 0.0;
    let amount = proposed.amount.to_f64().unwrap_or(0.0);

    // Amount anomaly vs trailing mean/stddev.
    if profile.sample_count() >= 2 {
        let stddev = profile.stddev_amount();
        if stddev > 0.0 {
            let z = (amount - profile.mean_amount()).abs() / stddev;
            if z > cfg.zscore_threshold {
                total += cfg.amount_anomaly_weight;
            }
        }
    }

    // Behavioral deviation from the trailing mean.
    if profile.sample_count() >= 2 && profile.mean_amount() > 0.0 {
        let deviation = (amount - profile.mean_amount()).abs() / profile.mean_amount();
        if deviation > cfg.behavioral_deviation {
            total += cfg.behavioral_weight;
        }
    }

    // Unusual hours (UTC); the window may wrap midnight.
    let hour = now.hour();
    let in_window = if cfg.unusual_hours_start <= cfg.unusual_hours_end {
        hour >= cfg.unusual_hours_start && hour < cfg.unusual_hours_end
    } else {
        hour >= cfg.unusual_hours_start || hour < cfg.unusual_hours_end
    };
    if in_window {
        total += cfg.unusual_hours_weight;
    }

    total.min(1.0)
}
