//! Safety Validator
//!
//! Composes limit checks with the risk scorer into a single accept/reject
//! decision, sequential and short-circuiting with the cheapest checks
//! first. No external I/O: the account-status and ledger reads are
//! in-process, so validation completes in microseconds.
//!
//! The validator is the only writer of [`RiskProfile`](crate::risk::RiskProfile)
//! aggregates; terminal outcomes are recorded exactly once per transaction
//! id through [`SafetyValidator::record_outcome`].

use crate::core_types::UserId;
use crate::error::CoreError;
use crate::ledger::{AccountKey, LedgerStore};
use crate::risk::{self, ProfileStore, RiskConfig};
use crate::transaction::{Transaction, TxKind, TxStatus};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Stable rejection reason codes surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    UserUnknown,
    UserInactive,
    AmountBelowMinimum,
    AmountAboveMaximum,
    MalformedSymbol,
    PriceNotPositive,
    PriceAboveMaximum,
    HourlyCapExceeded,
    DailyVolumeCapExceeded,
    Cooldown,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::UserUnknown => "USER_UNKNOWN",
            RejectReason::UserInactive => "USER_INACTIVE",
            RejectReason::AmountBelowMinimum => "AMOUNT_BELOW_MINIMUM",
            RejectReason::AmountAboveMaximum => "AMOUNT_ABOVE_MAXIMUM",
            RejectReason::MalformedSymbol => "MALFORMED_SYMBOL",
            RejectReason::PriceNotPositive => "PRICE_NOT_POSITIVE",
            RejectReason::PriceAboveMaximum => "PRICE_ABOVE_MAXIMUM",
            RejectReason::HourlyCapExceeded => "HOURLY_CAP_EXCEEDED",
            RejectReason::DailyVolumeCapExceeded => "DAILY_VOLUME_CAP_EXCEEDED",
            RejectReason::Cooldown => "COOLDOWN",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// User status as reported by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Suspended,
}

/// Read-only identity seam, implemented by the session layer elsewhere.
#[async_trait]
pub trait AccountStatusProvider: Send + Sync {
    async fn account_status(&self, user_id: UserId) -> Result<Option<AccountStatus>, CoreError>;
}

/// Absolute limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub min_trade_amount: Decimal,
    pub max_trade_amount: Decimal,
    pub min_withdrawal_amount: Decimal,
    pub max_withdrawal_amount: Decimal,
    pub max_hourly_count: u32,
    pub max_daily_volume: Decimal,
    pub max_symbol_len: usize,
    /// Absolute ceiling for a caller-supplied limit price.
    pub max_price: Decimal,
    /// Failures in a row that trigger the cooldown.
    pub cooldown_failures: u32,
    pub cooldown_window_secs: i64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_trade_amount: Decimal::new(1, 2), // 0.01
            max_trade_amount: Decimal::from(1_000_000u64),
            min_withdrawal_amount: Decimal::from(10u64),
            max_withdrawal_amount: Decimal::from(100_000u64),
            max_hourly_count: 100,
            max_daily_volume: Decimal::from(10_000_000u64),
            max_symbol_len: 12,
            max_price: Decimal::from(1_000_000_000u64),
            cooldown_failures: 3,
            cooldown_window_secs: 300,
        }
    }
}

impl SafetyConfig {
    fn bounds_for(&self, kind: TxKind) -> (Decimal, Decimal) {
        match kind {
            TxKind::Withdrawal => (self.min_withdrawal_amount, self.max_withdrawal_amount),
            _ => (self.min_trade_amount, self.max_trade_amount),
        }
    }
}

/// Outcome of a successful validation, consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub risk_score: f64,
    /// Version of the debited account at validation time, if the
    /// transaction is debit-type. The executor re-checks under commit.
    pub account_version: Option<u64>,
}

pub struct SafetyValidator {
    cfg: SafetyConfig,
    risk_cfg: RiskConfig,
    profiles: ProfileStore,
    identity: Arc<dyn AccountStatusProvider>,
    ledger: Arc<dyn LedgerStore>,
}

impl SafetyValidator {
    pub fn new(
        cfg: SafetyConfig,
        risk_cfg: RiskConfig,
        profiles: ProfileStore,
        identity: Arc<dyn AccountStatusProvider>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            cfg,
            risk_cfg,
            profiles,
            identity,
            ledger,
        }
    }

    fn reject(reason: RejectReason) -> CoreError {
        CoreError::ValidationRejected { reason }
    }

    /// Run the full check sequence against a proposed transaction.
    pub async fn validate(
        &self,
        user_id: UserId,
        proposed: &Transaction,
    ) -> Result<ValidationReport, CoreError> {
        let now = Utc::now();

        // 1. User exists and is active.
        match self.identity.account_status(user_id).await? {
            Some(AccountStatus::Active) => {}
            Some(AccountStatus::Suspended) => return Err(Self::reject(RejectReason::UserInactive)),
            None => return Err(Self::reject(RejectReason::UserUnknown)),
        }

        // 2. Amount within per-kind absolute bounds.
        let (min, max) = self.cfg.bounds_for(proposed.kind);
        if proposed.amount < min {
            return Err(Self::reject(RejectReason::AmountBelowMinimum));
        }
        if proposed.amount > max {
            return Err(Self::reject(RejectReason::AmountAboveMaximum));
        }

        // 3. Symbol format.
        if !proposed.pair.is_well_formed(self.cfg.max_symbol_len) {
            return Err(Self::reject(RejectReason::MalformedSymbol));
        }

        // 4. Limit price sanity, when the caller supplied one. A zero or
        // absurd price is a client bug, caught before any money moves.
        if let Some(price) = proposed.limit_price {
            if price <= Decimal::ZERO {
                return Err(Self::reject(RejectReason::PriceNotPositive));
            }
            if price > self.cfg.max_price {
                return Err(Self::reject(RejectReason::PriceAboveMaximum));
            }
        }

        // 5. Velocity caps.
        let profile = self.profiles.snapshot(user_id);
        if profile.hourly_count(now) + 1 > self.cfg.max_hourly_count {
            return Err(Self::reject(RejectReason::HourlyCapExceeded));
        }
        if profile.daily_volume(now) + proposed.amount > self.cfg.max_daily_volume {
            return Err(Self::reject(RejectReason::DailyVolumeCapExceeded));
        }

        // 6. Cooldown after a failure streak.
        if profile.consecutive_failures >= self.cfg.cooldown_failures {
            if let Some(last) = profile.last_failure_at {
                if now - last < Duration::seconds(self.cfg.cooldown_window_secs) {
                    warn!(user_id, failures = profile.consecutive_failures, "cooldown active");
                    return Err(Self::reject(RejectReason::Cooldown));
                }
            }
        }

        // 7. Balance for debit-type operations, read under the account's
        // current version. The executor re-checks at commit.
        let mut account_version = None;
        if proposed.is_debit() {
            if let Some(currency) = proposed.debit_currency() {
                let key = AccountKey::new(user_id, currency);
                let account = self
                    .ledger
                    .get(&key)
                    .await
                    .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
                let (available, version) = account
                    .map(|a| (a.available(), a.version()))
                    .unwrap_or((Decimal::ZERO, 0));
                if available < proposed.amount {
                    return Err(CoreError::InsufficientBalance {
                        available,
                        requested: proposed.amount,
                    });
                }
                account_version = Some(version);
            }
        }

        // 8. Risk score.
        let risk_score = risk::score(proposed, &profile, &self.risk_cfg, now);
        if risk_score >= self.risk_cfg.reject_threshold {
            warn!(user_id, risk_score, "risk rejection");
            return Err(CoreError::RiskRejected {
                score: risk_score,
                threshold: self.risk_cfg.reject_threshold,
            });
        }

        Ok(ValidationReport {
            risk_score,
            account_version,
        })
    }

    /// Record a terminal outcome into the user's risk profile. Idempotent
    /// per transaction id.
    pub fn record_outcome(&self, tx: &Transaction) {
        let success = tx.status == TxStatus::Completed;
        info!(
            user_id = tx.user_id,
            tx_id = %tx.id,
            kind = tx.kind.as_str(),
            status = tx.status.as_str(),
            amount = %tx.amount,
            "transaction outcome"
        );
        self.profiles
            .record_outcome(tx.user_id, tx.id, tx.amount, success, Utc::now());
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use dashmap::DashMap;

    /// Identity provider backed by a map; unknown users are absent.
    #[derive(Default)]
    pub struct MockIdentity {
        users: DashMap<UserId, AccountStatus>,
    }

    impl MockIdentity {
        pub fn with_active(users: &[UserId]) -> Self {
            let this = Self::default();
            for u in users {
                this.users.insert(*u, AccountStatus::Active);
            }
            this
        }

        pub fn suspend(&self, user_id: UserId) {
            self.users.insert(user_id, AccountStatus::Suspended);
        }
    }

    #[async_trait]
    impl AccountStatusProvider for MockIdentity {
        async fn account_status(
            &self,
            user_id: UserId,
        ) -> Result<Option<AccountStatus>, CoreError> {
            Ok(self.users.get(&user_id).map(|s| *s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockIdentity;
    use super::*;
    use crate::core_types::CurrencyPair;
    use crate::ledger::MemoryLedgerStore;
    use crate::transaction::Side;
    use rust_decimal_macros::dec;

    fn validator(ledger: Arc<MemoryLedgerStore>, identity: Arc<MockIdentity>) -> SafetyValidator {
        SafetyValidator::new(
            SafetyConfig::default(),
            RiskConfig::default(),
            ProfileStore::new(),
            identity,
            ledger,
        )
    }

    fn trade(user: UserId, amount: Decimal) -> Transaction {
        Transaction::new(
            user,
            TxKind::Trade,
            Some(Side::Sell),
            CurrencyPair::new("ETH", "USDC"),
            amount,
        )
    }

    fn setup() -> (SafetyValidator, Arc<MemoryLedgerStore>, Arc<MockIdentity>) {
        let ledger = Arc::new(MemoryLedgerStore::new());
        ledger.seed(AccountKey::new(1, "ETH"), dec!(100));
        let identity = Arc::new(MockIdentity::with_active(&[1]));
        let v = validator(ledger.clone(), identity.clone());
        (v, ledger, identity)
    }

    #[tokio::test]
    async fn test_accepts_ordinary_trade() {
        let (v, _, _) = setup();
        let report = v.validate(1, &trade(1, dec!(10))).await.unwrap();
        assert!(report.risk_score < 0.7);
        assert_eq!(report.account_version, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_and_suspended_users() {
        let (v, _, identity) = setup();
        let err = v.validate(99, &trade(99, dec!(10))).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_REJECTED");
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::UserUnknown
            }
        ));

        identity.suspend(1);
        let err = v.validate(1, &trade(1, dec!(10))).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::UserInactive
            }
        ));
    }

    #[tokio::test]
    async fn test_amount_bounds_per_kind() {
        let (v, _, _) = setup();
        let err = v.validate(1, &trade(1, dec!(0.001))).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::AmountBelowMinimum
            }
        ));

        let mut wd = Transaction::new(
            1,
            TxKind::Withdrawal,
            None,
            CurrencyPair::single("ETH"),
            dec!(5),
        );
        let err = v.validate(1, &wd).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::AmountBelowMinimum
            }
        ));
        wd.amount = dec!(200_000);
        let err = v.validate(1, &wd).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::AmountAboveMaximum
            }
        ));
    }

    #[tokio::test]
    async fn test_malformed_symbol() {
        let (v, _, _) = setup();
        let mut tx = trade(1, dec!(10));
        tx.pair = CurrencyPair::new("ETH!!", "USDC");
        let err = v.validate(1, &tx).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::MalformedSymbol
            }
        ));
    }

    #[tokio::test]
    async fn test_limit_price_sanity() {
        let (v, _, _) = setup();

        let mut tx = trade(1, dec!(10));
        tx.limit_price = Some(dec!(0));
        let err = v.validate(1, &tx).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::PriceNotPositive
            }
        ));

        tx.limit_price = Some(dec!(-3));
        let err = v.validate(1, &tx).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::PriceNotPositive
            }
        ));

        tx.limit_price = Some(dec!(1_000_000_001));
        let err = v.validate(1, &tx).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::PriceAboveMaximum
            }
        ));

        tx.limit_price = Some(dec!(1850.25));
        assert!(v.validate(1, &tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_insufficient_balance_for_debit() {
        let (v, _, _) = setup();
        let err = v.validate(1, &trade(1, dec!(500))).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_cooldown_after_three_failures() {
        let (v, _, _) = setup();
        for _ in 0..3 {
            let mut tx = trade(1, dec!(5));
            tx.status = TxStatus::Failed;
            v.record_outcome(&tx);
        }
        let err = v.validate(1, &trade(1, dec!(5))).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::Cooldown
            }
        ));
    }

    #[tokio::test]
    async fn test_outcome_recorded_once_per_tx() {
        let (v, _, _) = setup();
        let mut tx = trade(1, dec!(5));
        tx.status = TxStatus::Failed;
        // The same terminal outcome reported twice counts once.
        v.record_outcome(&tx);
        v.record_outcome(&tx);
        let ok = v.validate(1, &trade(1, dec!(5))).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_hourly_cap() {
        let ledger = Arc::new(MemoryLedgerStore::new());
        ledger.seed(AccountKey::new(1, "ETH"), dec!(1_000_000));
        let identity = Arc::new(MockIdentity::with_active(&[1]));
        let v = SafetyValidator::new(
            SafetyConfig {
                max_hourly_count: 2,
                ..Default::default()
            },
            RiskConfig::default(),
            ProfileStore::new(),
            identity,
            ledger,
        );
        for _ in 0..2 {
            let mut tx = trade(1, dec!(1));
            tx.status = TxStatus::Completed;
            v.record_outcome(&tx);
        }
        let err = v.validate(1, &trade(1, dec!(1))).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationRejected {
                reason: RejectReason::HourlyCapExceeded
            }
        ));
    }
}
