//! Read-side views for the account owner

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::catalog::{BillingConfig, PointsPackage, SubscriptionPlan};
use crate::clock::Clock;
use crate::error::{BillingError, Result};
use crate::ledger::PointsLedger;
use crate::model::{PaymentTransaction, Subscription, SubscriptionStatus, TransactionStatus};
use crate::quota::{current_usage, remaining_today};
use crate::store::{SubscriptionStore, TransactionStore};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub points_balance: i64,
    pub has_purchased: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub daily_points_limit: i64,

    /// Zero when the stored usage belongs to an earlier day
    pub daily_points_used: i64,

    pub remaining_today: i64,
    pub last_usage_reset_date: NaiveDate,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionView {
    pub fn new(subscription: &Subscription, today: NaiveDate) -> Self {
        Self {
            plan_id: subscription.plan_id.clone(),
            status: subscription.status,
            daily_points_limit: subscription.daily_points_limit,
            daily_points_used: current_usage(subscription, today),
            remaining_today: remaining_today(subscription, today),
            last_usage_reset_date: subscription.last_usage_reset_date,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusView {
    pub has_subscription: bool,
    pub subscription: Option<SubscriptionView>,
}

/// Checkout progress as seen by the paying account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusView {
    pub status: TransactionStatus,

    /// Reported only once the transaction is completed
    pub points_balance: Option<i64>,
    pub has_purchased: Option<bool>,

    pub completed_at: Option<DateTime<Utc>>,
}

pub struct BillingQueries {
    config: Arc<BillingConfig>,
    ledger: PointsLedger,
    subscriptions: Arc<dyn SubscriptionStore>,
    transactions: Arc<dyn TransactionStore>,
    clock: Arc<dyn Clock>,
}

impl BillingQueries {
    pub fn new(
        config: Arc<BillingConfig>,
        ledger: PointsLedger,
        subscriptions: Arc<dyn SubscriptionStore>,
        transactions: Arc<dyn TransactionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            subscriptions,
            transactions,
            clock,
        }
    }

    pub async fn balance(&self, account_id: &str) -> Result<BalanceView> {
        let account = self
            .ledger
            .account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))?;

        Ok(BalanceView {
            points_balance: account.points_balance,
            has_purchased: account.has_purchased,
        })
    }

    pub async fn subscription_status(&self, account_id: &str) -> Result<SubscriptionStatusView> {
        let subscription = self
            .subscriptions
            .find_active_subscription(account_id)
            .await?
            .map(|s| SubscriptionView::new(&s, self.clock.today()));

        Ok(SubscriptionStatusView {
            has_subscription: subscription.is_some(),
            subscription,
        })
    }

    /// Newest first
    pub async fn payment_history(&self, account_id: &str) -> Result<Vec<PaymentTransaction>> {
        self.transactions.list_transactions(account_id).await
    }

    pub async fn poll_payment_status(&self, account_id: &str, session_ref: &str) -> Result<PaymentStatusView> {
        let transaction = self
            .transactions
            .find_transaction_by_session(session_ref)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(session_ref.to_string()))?;

        if transaction.account_id != account_id {
            return Err(BillingError::Forbidden(format!("session {session_ref}")));
        }

        let mut view = PaymentStatusView {
            status: transaction.status,
            points_balance: None,
            has_purchased: None,
            completed_at: transaction.completed_at,
        };
        if transaction.status == TransactionStatus::Completed {
            let balance = self.balance(account_id).await?;
            view.points_balance = Some(balance.points_balance);
            view.has_purchased = Some(balance.has_purchased);
        }
        Ok(view)
    }

    pub fn packages(&self) -> &[PointsPackage] {
        &self.config.catalog.packages
    }

    pub fn plans(&self) -> &[SubscriptionPlan] {
        &self.config.catalog.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{BillingPeriod, NewAccount, NewSubscription, NewTransaction};
    use crate::store::{AccountStore, MemoryStore};
    use chrono::{Duration, TimeZone};

    async fn setup() -> (BillingQueries, Arc<MemoryStore>, Arc<FixedClock>) {
        let store = Arc::new(MemoryStore::new());
        store.create_account(NewAccount::new("u1")).await.unwrap();
        store.create_account(NewAccount::new("u2")).await.unwrap();
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap()));
        let queries = BillingQueries::new(
            Arc::new(BillingConfig::default()),
            PointsLedger::new(store.clone()),
            store.clone(),
            store.clone(),
            clock.clone(),
        );
        (queries, store, clock)
    }

    async fn pending(store: &MemoryStore, account_id: &str, session: &str) -> PaymentTransaction {
        store
            .create_transaction(NewTransaction {
                account_id: account_id.into(),
                external_session_ref: session.into(),
                package_id: "starter".into(),
                points_purchased: 3750,
                amount_paid: 1000,
                currency: "usd".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_balance_of_unknown_account() {
        let (queries, _, _) = setup().await;
        assert!(matches!(
            queries.balance("ghost").await,
            Err(BillingError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_view_applies_logical_reset() {
        let (queries, store, clock) = setup().await;
        assert!(!queries.subscription_status("u1").await.unwrap().has_subscription);

        let now = clock.now();
        let sub = store
            .create_subscription(NewSubscription {
                account_id: "u1".into(),
                plan_id: "basic".into(),
                external_subscription_ref: "sub_1".into(),
                payment_customer_ref: None,
                daily_points_limit: 708,
                period: BillingPeriod { start: now, end: now + Duration::days(30) },
                today: clock.today(),
                created_at: now,
            })
            .await
            .unwrap();
        store
            .increment_daily_points_used(sub.id, 300, clock.today())
            .await
            .unwrap();

        let view = queries.subscription_status("u1").await.unwrap().subscription.unwrap();
        assert_eq!(view.daily_points_used, 300);
        assert_eq!(view.remaining_today, 408);

        clock.advance(Duration::days(1));
        let view = queries.subscription_status("u1").await.unwrap().subscription.unwrap();
        assert_eq!(view.daily_points_used, 0);
        assert_eq!(view.remaining_today, 708);
    }

    #[tokio::test]
    async fn test_poll_hides_balance_until_completed() {
        let (queries, store, clock) = setup().await;
        let tx = pending(&store, "u1", "cs_1").await;

        let view = queries.poll_payment_status("u1", "cs_1").await.unwrap();
        assert_eq!(view.status, TransactionStatus::Pending);
        assert_eq!(view.points_balance, None);

        store.complete_purchase(tx.id, None, clock.now()).await.unwrap();
        let view = queries.poll_payment_status("u1", "cs_1").await.unwrap();
        assert_eq!(view.points_balance, Some(3750));
        assert_eq!(view.completed_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_poll_checks_ownership() {
        let (queries, store, _) = setup().await;
        pending(&store, "u2", "cs_2").await;

        assert!(matches!(
            queries.poll_payment_status("u1", "cs_2").await,
            Err(BillingError::Forbidden(_))
        ));
        assert!(matches!(
            queries.poll_payment_status("u1", "cs_missing").await,
            Err(BillingError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_listing_hides_price_ids() {
        let (queries, _, _) = setup().await;
        assert_eq!(queries.plans().len(), 2);
        let json = serde_json::to_value(queries.packages()).unwrap();
        assert!(json[0].get("gatewayPriceId").is_none());
        assert_eq!(json[0]["points"], 3750);
    }
}
