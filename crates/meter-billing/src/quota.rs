//! Subscription Quota Tracker
//!
//! Daily allowance accounting. Usage recorded on an earlier UTC date counts as
//! zero until the next charge persists the reset.

use chrono::NaiveDate;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{DailyUsage, Subscription};
use crate::store::SubscriptionStore;

/// Usage as of `today`, with the day-boundary reset applied logically
pub fn current_usage(subscription: &Subscription, today: NaiveDate) -> i64 {
    if subscription.last_usage_reset_date == today {
        subscription.daily_points_used
    } else {
        0
    }
}

/// Allowance left for `today`, never negative
pub fn remaining_today(subscription: &Subscription, today: NaiveDate) -> i64 {
    (subscription.daily_points_limit - current_usage(subscription, today)).max(0)
}

#[derive(Clone)]
pub struct QuotaTracker {
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl QuotaTracker {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        Self { subscriptions }
    }

    /// Canonical (most recent) active subscription
    pub async fn active_subscription(&self, account_id: &str) -> Result<Option<Subscription>> {
        self.subscriptions.find_active_subscription(account_id).await
    }

    /// Charge the daily allowance in one storage step
    pub async fn increment_daily_points_used(
        &self,
        subscription_id: Uuid,
        amount: i64,
        today: NaiveDate,
    ) -> Result<DailyUsage> {
        let usage = self
            .subscriptions
            .increment_daily_points_used(subscription_id, amount, today)
            .await?;

        tracing::debug!(
            subscription_id = %subscription_id,
            amount,
            daily_points_used = usage.daily_points_used,
            was_reset = usage.was_reset,
            "Daily usage charged"
        );
        Ok(usage)
    }
}
