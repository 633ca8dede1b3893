//! Mock Payment Gateway
//!
//! For tests and local development. Sessions and customers get sequential ids.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CheckoutRequest, HostedCheckout, PaymentGateway};
use crate::error::{BillingError, Result};
use crate::model::Account;
use crate::webhook::SubscriptionObject;

#[derive(Default)]
pub struct MockPaymentGateway {
    next_id: AtomicU64,
    checkouts: Mutex<Vec<CheckoutRequest>>,
    subscriptions: Mutex<HashMap<String, SubscriptionObject>>,
    canceled: Mutex<Vec<String>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `retrieve_subscription` return this object
    pub fn insert_subscription(&self, subscription: SubscriptionObject) {
        lock(&self.subscriptions).insert(subscription.id.clone(), subscription);
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        lock(&self.checkouts).clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        lock(&self.canceled).clone()
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}_mock_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// A panicking test must not hide later calls from its assertions
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_customer(&self, _account: &Account) -> Result<String> {
        Ok(self.next("cus"))
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<HostedCheckout> {
        let session_ref = self.next("cs");
        lock(&self.checkouts).push(request);
        Ok(HostedCheckout {
            url: format!("https://checkout.invalid/{session_ref}"),
            session_ref,
        })
    }

    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<SubscriptionObject> {
        lock(&self.subscriptions)
            .get(subscription_ref)
            .cloned()
            .ok_or_else(|| BillingError::Gateway(format!("no such subscription: {subscription_ref}")))
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<()> {
        if let Some(sub) = lock(&self.subscriptions).get_mut(subscription_ref) {
            sub.cancel_at_period_end = true;
        }
        lock(&self.canceled).push(subscription_ref.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "Mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CheckoutMode;
    use std::sync::Arc;

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            mode: CheckoutMode::Payment,
            customer_ref: "cus_1".into(),
            price_ref: "price_starter".into(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_calls_recorded_after_poisoned_lock() {
        let gateway = Arc::new(MockPaymentGateway::new());
        let holder = gateway.clone();
        let joined = std::thread::spawn(move || {
            let _guard = holder.checkouts.lock().unwrap();
            panic!("panicked while holding the lock");
        })
        .join();
        assert!(joined.is_err());
        assert!(gateway.checkouts.is_poisoned());

        gateway.create_checkout(request()).await.unwrap();
        gateway.create_checkout(request()).await.unwrap();
        assert_eq!(gateway.checkouts().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_marks_known_subscription() {
        let gateway = MockPaymentGateway::new();
        gateway.insert_subscription(SubscriptionObject {
            id: "sub_1".into(),
            ..Default::default()
        });

        gateway.cancel_at_period_end("sub_1").await.unwrap();
        assert!(gateway.retrieve_subscription("sub_1").await.unwrap().cancel_at_period_end);
        assert_eq!(gateway.canceled(), vec!["sub_1".to_string()]);
        assert!(gateway.retrieve_subscription("sub_2").await.is_err());
    }
}
