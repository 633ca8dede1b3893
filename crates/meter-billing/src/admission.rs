//! Admission Controller
//!
//! Two-phase protocol around a paid capability call:
//!
//! 1. [`AdmissionController::ensure_usable`] runs before the call and checks a
//!    fixed conservative threshold, since the real cost is not known yet.
//! 2. [`AdmissionController::settle`] runs after the call and charges the exact
//!    cost, daily allowance first, purchased points second.
//!
//! No lock is held across the capability call. Two concurrent requests can both
//! pass pre-flight, but settlement is atomic and conditional, so a balance can
//! never go negative. A settlement that cannot be collected is recorded as a
//! billing exception.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::catalog::BillingConfig;
use crate::clock::Clock;
use crate::error::{BillingError, PaymentRequiredReason, Result};
use crate::ledger::PointsLedger;
use crate::model::NewBillingException;
use crate::quota::{QuotaTracker, remaining_today};
use crate::store::ExceptionStore;

/// Pre-flight decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Admission {
    /// Free capability, no ledger consulted
    Free,

    /// Covered by today's subscription allowance
    Subscription { remaining_today: i64 },

    /// Covered by purchased points
    Points { balance: i64 },
}

/// Daily allowance after a subscription-backed settlement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUsage {
    pub daily_points_used: i64,
    pub daily_points_limit: i64,
    pub remaining_today: i64,
    pub was_reset: bool,
}

/// Outcome of a settled request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSummary {
    pub capability_id: String,
    pub cost: i64,

    /// Points taken from the purchased balance
    pub deducted: i64,

    pub remaining_balance: Option<i64>,
    pub was_free: bool,
    pub subscription_usage: Option<SubscriptionUsage>,
}

impl SettlementSummary {
    fn free(capability_id: &str) -> Self {
        Self {
            capability_id: capability_id.to_string(),
            cost: 0,
            deducted: 0,
            remaining_balance: None,
            was_free: true,
            subscription_usage: None,
        }
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    config: Arc<BillingConfig>,
    ledger: PointsLedger,
    quota: QuotaTracker,
    exceptions: Arc<dyn ExceptionStore>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(
        config: Arc<BillingConfig>,
        ledger: PointsLedger,
        quota: QuotaTracker,
        exceptions: Arc<dyn ExceptionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            quota,
            exceptions,
            clock,
        }
    }

    /// Decide whether a request may invoke the capability
    pub async fn ensure_usable(&self, account_id: &str, capability_id: &str) -> Result<Admission> {
        if self.config.catalog.capability(capability_id)?.free {
            return Ok(Admission::Free);
        }

        let account = self
            .ledger
            .account(account_id)
            .await?
            .ok_or(BillingError::Unauthenticated)?;

        let threshold = self.config.min_preflight_points;
        let subscription = self.quota.active_subscription(account_id).await?;

        if let Some(subscription) = &subscription {
            let remaining = remaining_today(subscription, self.clock.today());
            if remaining >= threshold {
                return Ok(Admission::Subscription {
                    remaining_today: remaining,
                });
            }
        }

        if account.has_purchased && account.points_balance >= threshold {
            return Ok(Admission::Points {
                balance: account.points_balance,
            });
        }

        let reason = if subscription.is_some() {
            PaymentRequiredReason::DailyQuotaExhausted
        } else if !account.has_purchased {
            PaymentRequiredReason::NoPurchase
        } else {
            PaymentRequiredReason::InsufficientPoints
        };

        tracing::info!(
            account_id = %account_id,
            capability_id = %capability_id,
            reason = ?reason,
            "Admission refused"
        );
        Err(BillingError::PaymentRequired(reason))
    }

    /// Charge the exact cost of a completed request
    pub async fn settle(
        &self,
        account_id: &str,
        capability_id: &str,
        input_units: u64,
        output_units: u64,
    ) -> Result<SettlementSummary> {
        if self.config.catalog.capability(capability_id)?.free {
            return Ok(SettlementSummary::free(capability_id));
        }

        let cost = self
            .config
            .points_cost(capability_id, input_units, output_units)?;
        let today = self.clock.today();

        // Re-read: usage may have moved since pre-flight
        if let Some(subscription) = self.quota.active_subscription(account_id).await? {
            if remaining_today(&subscription, today) >= cost {
                let usage = self
                    .quota
                    .increment_daily_points_used(subscription.id, cost, today)
                    .await?;
                let balance = self
                    .ledger
                    .account(account_id)
                    .await?
                    .map(|a| a.points_balance);

                return Ok(SettlementSummary {
                    capability_id: capability_id.to_string(),
                    cost,
                    deducted: 0,
                    remaining_balance: balance,
                    was_free: false,
                    subscription_usage: Some(SubscriptionUsage {
                        daily_points_used: usage.daily_points_used,
                        daily_points_limit: subscription.daily_points_limit,
                        remaining_today: (subscription.daily_points_limit - usage.daily_points_used)
                            .max(0),
                        was_reset: usage.was_reset,
                    }),
                });
            }
        }

        match self.ledger.deduct_points(account_id, cost).await {
            Ok(balance) => Ok(SettlementSummary {
                capability_id: capability_id.to_string(),
                cost,
                deducted: cost,
                remaining_balance: Some(balance),
                was_free: false,
                subscription_usage: None,
            }),
            Err(err) => {
                self.record_exception(account_id, capability_id, cost, &err).await;
                Err(err)
            }
        }
    }

    async fn record_exception(&self, account_id: &str, capability_id: &str, cost: i64, err: &BillingError) {
        tracing::error!(
            account_id = %account_id,
            capability_id = %capability_id,
            cost,
            error = %err,
            "Settlement failed after result was produced"
        );

        let exception = NewBillingException {
            account_id: account_id.to_string(),
            capability_id: Some(capability_id.to_string()),
            cost,
            reason: err.to_string(),
        };
        if let Err(e) = self.exceptions.record_exception(exception).await {
            tracing::error!(account_id = %account_id, error = %e, "Failed to record billing exception");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{BillingPeriod, NewAccount, NewSubscription};
    use crate::store::{AccountStore, MemoryStore, SubscriptionStore};
    use chrono::{Duration, TimeZone, Utc};

    const PAID: &str = "claude-opus-4.6";
    const FREE: &str = "devstral-latest";

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
        admission: AdmissionController,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap()));
            let admission = AdmissionController::new(
                Arc::new(BillingConfig::default()),
                PointsLedger::new(store.clone()),
                QuotaTracker::new(store.clone()),
                store.clone(),
                clock.clone(),
            );
            Self { store, clock, admission }
        }

        async fn account(&self, balance: i64, has_purchased: bool) {
            self.store.create_account(NewAccount::new("u1")).await.unwrap();
            self.store.add_points("u1", balance).await.unwrap();
            if has_purchased {
                self.store.mark_purchased("u1").await.unwrap();
            }
        }

        async fn subscription(&self, used: i64, reset_date: chrono::NaiveDate) -> uuid::Uuid {
            let now = self.clock.now();
            let sub = self
                .store
                .create_subscription(NewSubscription {
                    account_id: "u1".into(),
                    plan_id: "basic".into(),
                    external_subscription_ref: "sub_1".into(),
                    payment_customer_ref: None,
                    daily_points_limit: 700,
                    period: BillingPeriod { start: now, end: now + Duration::days(30) },
                    today: reset_date,
                    created_at: now,
                })
                .await
                .unwrap();
            if used > 0 {
                self.store
                    .increment_daily_points_used(sub.id, used, reset_date)
                    .await
                    .unwrap();
            }
            sub.id
        }

        async fn balance(&self) -> i64 {
            self.store.find_account("u1").await.unwrap().unwrap().points_balance
        }
    }

    #[tokio::test]
    async fn test_free_capability_skips_ledgers() {
        let h = Harness::new();
        assert_eq!(h.admission.ensure_usable("nobody", FREE).await.unwrap(), Admission::Free);

        let summary = h.admission.settle("nobody", FREE, 1_000_000, 1_000_000).await.unwrap();
        assert!(summary.was_free);
        assert_eq!(summary.cost, 0);
    }

    #[tokio::test]
    async fn test_unknown_account_is_unauthenticated() {
        let h = Harness::new();
        assert!(matches!(
            h.admission.ensure_usable("ghost", PAID).await,
            Err(BillingError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let h = Harness::new();
        h.account(100, true).await;
        assert!(matches!(
            h.admission.ensure_usable("u1", "nope").await,
            Err(BillingError::UnknownCapability(_))
        ));
        assert!(matches!(
            h.admission.settle("u1", "nope", 1, 1).await,
            Err(BillingError::UnknownCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_preflight_reasons() {
        let h = Harness::new();
        h.account(0, false).await;
        assert!(matches!(
            h.admission.ensure_usable("u1", PAID).await,
            Err(BillingError::PaymentRequired(PaymentRequiredReason::NoPurchase))
        ));

        h.store.mark_purchased("u1").await.unwrap();
        h.store.add_points("u1", 5).await.unwrap();
        assert!(matches!(
            h.admission.ensure_usable("u1", PAID).await,
            Err(BillingError::PaymentRequired(PaymentRequiredReason::InsufficientPoints))
        ));

        let today = h.clock.today();
        h.subscription(695, today).await;
        assert!(matches!(
            h.admission.ensure_usable("u1", PAID).await,
            Err(BillingError::PaymentRequired(PaymentRequiredReason::DailyQuotaExhausted))
        ));

        h.store.add_points("u1", 20).await.unwrap();
        assert_eq!(
            h.admission.ensure_usable("u1", PAID).await.unwrap(),
            Admission::Points { balance: 25 }
        );
    }

    #[tokio::test]
    async fn test_preflight_uses_logical_reset() {
        let h = Harness::new();
        h.account(0, false).await;
        let yesterday = h.clock.today().pred_opt().unwrap();
        h.subscription(700, yesterday).await;

        assert_eq!(
            h.admission.ensure_usable("u1", PAID).await.unwrap(),
            Admission::Subscription { remaining_today: 700 }
        );
    }

    #[tokio::test]
    async fn test_insufficient_balance_at_settlement_is_recorded() {
        let h = Harness::new();
        h.account(100, true).await;

        // 30k output units of a 25 USD/M capability is 375 points
        let err = h.admission.settle("u1", PAID, 0, 30_000).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBalance { needed: 375, available: 100 }));
        assert_eq!(h.balance().await, 100);

        let exceptions = h.store.list_exceptions(10).await.unwrap();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].cost, 375);
        assert_eq!(exceptions[0].capability_id.as_deref(), Some(PAID));
    }

    #[tokio::test]
    async fn test_subscription_takes_precedence_over_points() {
        let h = Harness::new();
        h.account(500, true).await;
        let today = h.clock.today();
        h.subscription(650, today).await;

        // 10k input + 1200 output units costs exactly 40 points
        let summary = h.admission.settle("u1", PAID, 10_000, 1_200).await.unwrap();
        assert_eq!(summary.cost, 40);
        assert_eq!(summary.deducted, 0);
        let usage = summary.subscription_usage.unwrap();
        assert_eq!(usage.daily_points_used, 690);
        assert_eq!(usage.remaining_today, 10);
        assert!(!usage.was_reset);
        assert_eq!(h.balance().await, 500);
    }

    #[tokio::test]
    async fn test_settlement_resets_stale_day() {
        let h = Harness::new();
        h.account(0, false).await;
        let yesterday = h.clock.today().pred_opt().unwrap();
        h.subscription(650, yesterday).await;

        let summary = h.admission.settle("u1", PAID, 10_000, 1_200).await.unwrap();
        let usage = summary.subscription_usage.unwrap();
        assert_eq!(usage.daily_points_used, 40);
        assert!(usage.was_reset);

        let sub = h.store.find_subscription_by_ref("sub_1").await.unwrap().unwrap();
        assert_eq!(sub.last_usage_reset_date, h.clock.today());
    }

    #[tokio::test]
    async fn test_exhausted_allowance_falls_back_to_points() {
        let h = Harness::new();
        h.account(100, true).await;
        let today = h.clock.today();
        h.subscription(690, today).await;

        let summary = h.admission.settle("u1", PAID, 10_000, 1_200).await.unwrap();
        assert_eq!(summary.deducted, 40);
        assert_eq!(summary.remaining_balance, Some(60));
        assert!(summary.subscription_usage.is_none());

        let sub = h.store.find_subscription_by_ref("sub_1").await.unwrap().unwrap();
        assert_eq!(sub.daily_points_used, 690);
    }

    #[tokio::test]
    async fn test_concurrent_settlements_never_overdraw() {
        let h = Harness::new();
        h.account(100, true).await;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let admission = h.admission.clone();
            handles.push(tokio::spawn(async move {
                admission.settle("u1", PAID, 10_000, 1_200).await
            }));
        }
        let mut settled = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                settled += 1;
            }
        }

        assert_eq!(settled, 2);
        assert_eq!(h.balance().await, 20);
        assert_eq!(h.store.list_exceptions(10).await.unwrap().len(), 4);
    }
}
