//! Checkout and Cancellation
//!
//! Opens hosted checkouts for points packages and subscription plans. The
//! session metadata written here is what the reconciler reads back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::BillingConfig;
use crate::clock::Clock;
use crate::error::{BillingError, Result};
use crate::gateway::{CheckoutMode, CheckoutRequest, PaymentGateway};
use crate::ledger::PointsLedger;
use crate::model::{Account, NewTransaction, SubscriptionPatch};
use crate::store::{SubscriptionStore, TransactionStore};

/// Settlement currency for every catalog price
pub const CURRENCY: &str = "usd";

/// Result of creating a checkout session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,

    /// URL to redirect user to
    pub checkout_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub cancel_at_period_end: bool,
    pub current_period_end: DateTime<Utc>,
}

pub struct CheckoutService {
    config: Arc<BillingConfig>,
    ledger: PointsLedger,
    subscriptions: Arc<dyn SubscriptionStore>,
    transactions: Arc<dyn TransactionStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl CheckoutService {
    pub fn new(
        config: Arc<BillingConfig>,
        ledger: PointsLedger,
        subscriptions: Arc<dyn SubscriptionStore>,
        transactions: Arc<dyn TransactionStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            subscriptions,
            transactions,
            gateway,
            clock,
        }
    }

    /// One-off purchase of a points package
    pub async fn create_points_checkout(&self, account_id: &str, package_id: &str) -> Result<CheckoutSession> {
        let account = self.require_account(account_id).await?;
        let package = self
            .config
            .catalog
            .package(package_id)
            .ok_or_else(|| BillingError::UnknownPackage(package_id.to_string()))?;
        let price_ref = package
            .gateway_price_id
            .clone()
            .ok_or_else(|| BillingError::Config(format!("no gateway price for package {package_id}")))?;

        let customer_ref = self.ensure_customer(&account).await?;
        let metadata = HashMap::from([
            ("account_id".to_string(), account.id.clone()),
            ("package_id".to_string(), package.id.clone()),
            ("points".to_string(), package.points.to_string()),
        ]);

        let hosted = self
            .gateway
            .create_checkout(CheckoutRequest {
                mode: CheckoutMode::Payment,
                customer_ref,
                price_ref,
                metadata,
            })
            .await?;

        self.transactions
            .create_transaction(NewTransaction {
                account_id: account.id.clone(),
                external_session_ref: hosted.session_ref.clone(),
                package_id: package.id.clone(),
                points_purchased: package.points,
                amount_paid: package.price_cents,
                currency: CURRENCY.to_string(),
                created_at: self.clock.now(),
            })
            .await?;

        tracing::info!(
            account_id = %account.id,
            package_id = %package.id,
            session_ref = %hosted.session_ref,
            "Created points checkout"
        );

        Ok(CheckoutSession {
            session_id: hosted.session_ref,
            checkout_url: hosted.url,
        })
    }

    /// Recurring plan. Refused while another subscription is active.
    pub async fn create_subscription_checkout(&self, account_id: &str, plan_id: &str) -> Result<CheckoutSession> {
        let account = self.require_account(account_id).await?;
        let plan = self
            .config
            .catalog
            .plan(plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))?;
        let price_ref = plan
            .gateway_price_id
            .clone()
            .ok_or_else(|| BillingError::Config(format!("no gateway price for plan {plan_id}")))?;

        if self.subscriptions.find_active_subscription(account_id).await?.is_some() {
            return Err(BillingError::SubscriptionAlreadyActive);
        }

        let customer_ref = self.ensure_customer(&account).await?;
        let metadata = HashMap::from([
            ("account_id".to_string(), account.id.clone()),
            ("plan_id".to_string(), plan.id.clone()),
        ]);

        let hosted = self
            .gateway
            .create_checkout(CheckoutRequest {
                mode: CheckoutMode::Subscription,
                customer_ref,
                price_ref,
                metadata,
            })
            .await?;

        tracing::info!(
            account_id = %account.id,
            plan_id = %plan.id,
            session_ref = %hosted.session_ref,
            "Created subscription checkout"
        );

        Ok(CheckoutSession {
            session_id: hosted.session_ref,
            checkout_url: hosted.url,
        })
    }

    /// Stop renewal at the end of the current period. The status change
    /// itself arrives later as a webhook.
    pub async fn cancel_subscription(&self, account_id: &str) -> Result<Cancellation> {
        let subscription = self
            .subscriptions
            .find_active_subscription(account_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(account_id.to_string()))?;

        self.gateway
            .cancel_at_period_end(&subscription.external_subscription_ref)
            .await?;
        self.subscriptions
            .update_subscription(
                subscription.id,
                SubscriptionPatch {
                    cancel_at_period_end: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            subscription_ref = %subscription.external_subscription_ref,
            "Subscription set to cancel at period end"
        );

        Ok(Cancellation {
            cancel_at_period_end: true,
            current_period_end: subscription.current_period_end,
        })
    }

    async fn require_account(&self, account_id: &str) -> Result<Account> {
        self.ledger
            .account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))
    }

    /// Reuse the bound customer, or create one and bind it. Concurrent
    /// callers converge on whichever reference was bound first.
    async fn ensure_customer(&self, account: &Account) -> Result<String> {
        if let Some(existing) = &account.payment_customer_ref {
            return Ok(existing.clone());
        }

        let created = self.gateway.create_customer(account).await?;
        self.ledger.bind_customer_ref(&account.id, &created).await?;

        Ok(self
            .ledger
            .account(&account.id)
            .await?
            .and_then(|a| a.payment_customer_ref)
            .unwrap_or(created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::gateway::MockPaymentGateway;
    use crate::model::{BillingPeriod, NewAccount, NewSubscription, TransactionStatus};
    use crate::store::{AccountStore, MemoryStore};
    use chrono::Duration;

    fn config_with_prices() -> BillingConfig {
        let mut config = BillingConfig::default();
        for plan in &mut config.catalog.plans {
            plan.gateway_price_id = Some(format!("price_{}", plan.id));
        }
        for package in &mut config.catalog.packages {
            package.gateway_price_id = Some(format!("price_{}", package.id));
        }
        config
    }

    async fn setup(config: BillingConfig) -> (CheckoutService, Arc<MemoryStore>, Arc<MockPaymentGateway>) {
        let store = Arc::new(MemoryStore::new());
        store.create_account(NewAccount::new("u1")).await.unwrap();
        let gateway = Arc::new(MockPaymentGateway::new());
        let service = CheckoutService::new(
            Arc::new(config),
            PointsLedger::new(store.clone()),
            store.clone(),
            store.clone(),
            gateway.clone(),
            Arc::new(SystemClock),
        );
        (service, store, gateway)
    }

    async fn activate(store: &MemoryStore) {
        let now = Utc::now();
        store
            .create_subscription(NewSubscription {
                account_id: "u1".into(),
                plan_id: "basic".into(),
                external_subscription_ref: "sub_1".into(),
                payment_customer_ref: None,
                daily_points_limit: 708,
                period: BillingPeriod { start: now, end: now + Duration::days(30) },
                today: now.date_naive(),
                created_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_points_checkout_records_pending_transaction() {
        let (service, store, gateway) = setup(config_with_prices()).await;

        let session = service.create_points_checkout("u1", "starter").await.unwrap();
        let tx = store
            .find_transaction_by_session(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.points_purchased, 3750);
        assert_eq!(tx.amount_paid, 1000);

        let request = &gateway.checkouts()[0];
        assert_eq!(request.mode, CheckoutMode::Payment);
        assert_eq!(request.price_ref, "price_starter");
        assert_eq!(request.metadata.get("points").map(String::as_str), Some("3750"));
    }

    #[tokio::test]
    async fn test_customer_is_created_once() {
        let (service, store, gateway) = setup(config_with_prices()).await;

        service.create_points_checkout("u1", "starter").await.unwrap();
        service.create_points_checkout("u1", "starter").await.unwrap();

        let bound = store.find_account("u1").await.unwrap().unwrap().payment_customer_ref;
        let checkouts = gateway.checkouts();
        assert!(bound.is_some());
        assert!(checkouts.iter().all(|c| Some(&c.customer_ref) == bound.as_ref()));
    }

    #[tokio::test]
    async fn test_unknown_ids_and_missing_prices() {
        let (service, _, _) = setup(config_with_prices()).await;
        assert!(matches!(
            service.create_points_checkout("u1", "mega").await,
            Err(BillingError::UnknownPackage(_))
        ));
        assert!(matches!(
            service.create_subscription_checkout("u1", "gold").await,
            Err(BillingError::UnknownPlan(_))
        ));
        assert!(matches!(
            service.create_points_checkout("ghost", "starter").await,
            Err(BillingError::AccountNotFound(_))
        ));

        let (unpriced, _, _) = setup(BillingConfig::default()).await;
        assert!(matches!(
            unpriced.create_points_checkout("u1", "starter").await,
            Err(BillingError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_checkout_refused_when_active() {
        let (service, store, gateway) = setup(config_with_prices()).await;

        let session = service.create_subscription_checkout("u1", "premium").await.unwrap();
        assert!(!session.checkout_url.is_empty());
        let request = &gateway.checkouts()[0];
        assert_eq!(request.mode, CheckoutMode::Subscription);
        assert_eq!(request.metadata.get("plan_id").map(String::as_str), Some("premium"));

        activate(&store).await;
        assert!(matches!(
            service.create_subscription_checkout("u1", "premium").await,
            Err(BillingError::SubscriptionAlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_locally_and_remotely() {
        let (service, store, gateway) = setup(config_with_prices()).await;
        assert!(matches!(
            service.cancel_subscription("u1").await,
            Err(BillingError::SubscriptionNotFound(_))
        ));

        activate(&store).await;
        let cancellation = service.cancel_subscription("u1").await.unwrap();
        assert!(cancellation.cancel_at_period_end);
        assert_eq!(gateway.canceled(), vec!["sub_1".to_string()]);

        let sub = store.find_subscription_by_ref("sub_1").await.unwrap().unwrap();
        assert!(sub.cancel_at_period_end);
        assert_eq!(sub.status, crate::model::SubscriptionStatus::Active);
    }
}
