//! Service wiring over a single storage backend

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::catalog::BillingConfig;
use crate::checkout::CheckoutService;
use crate::clock::Clock;
use crate::gateway::PaymentGateway;
use crate::ledger::PointsLedger;
use crate::queries::BillingQueries;
use crate::quota::QuotaTracker;
use crate::reconcile::PaymentReconciler;
use crate::store::{BillingStore, ExceptionStore, HandoffStore, SubscriptionStore, TransactionStore};
use crate::webhook::SignatureVerifier;

/// Metering core, usable without a payment gateway
pub struct Billing {
    pub config: Arc<BillingConfig>,
    pub ledger: PointsLedger,
    pub quota: QuotaTracker,
    pub admission: AdmissionController,
    pub queries: BillingQueries,
    pub exceptions: Arc<dyn ExceptionStore>,
    pub handoffs: Arc<dyn HandoffStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    transactions: Arc<dyn TransactionStore>,
    clock: Arc<dyn Clock>,
}

impl Billing {
    pub fn new<S: BillingStore + 'static>(config: BillingConfig, store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        let ledger = PointsLedger::new(store.clone());
        let quota = QuotaTracker::new(store.clone());
        let subscriptions: Arc<dyn SubscriptionStore> = store.clone();
        let transactions: Arc<dyn TransactionStore> = store.clone();
        let exceptions: Arc<dyn ExceptionStore> = store.clone();

        let admission = AdmissionController::new(
            config.clone(),
            ledger.clone(),
            quota.clone(),
            exceptions.clone(),
            clock.clone(),
        );
        let queries = BillingQueries::new(
            config.clone(),
            ledger.clone(),
            subscriptions.clone(),
            transactions.clone(),
            clock.clone(),
        );

        Self {
            config,
            ledger,
            quota,
            admission,
            queries,
            exceptions,
            handoffs: store,
            subscriptions,
            transactions,
            clock,
        }
    }

    /// Checkout and reconciliation bound to a gateway
    pub fn payments(&self, gateway: Arc<dyn PaymentGateway>, verifier: SignatureVerifier) -> Payments {
        Payments {
            checkout: CheckoutService::new(
                self.config.clone(),
                self.ledger.clone(),
                self.subscriptions.clone(),
                self.transactions.clone(),
                gateway.clone(),
                self.clock.clone(),
            ),
            reconciler: PaymentReconciler::new(
                self.config.clone(),
                self.ledger.clone(),
                self.subscriptions.clone(),
                self.transactions.clone(),
                self.exceptions.clone(),
                gateway,
                verifier,
                self.clock.clone(),
            ),
        }
    }
}

pub struct Payments {
    pub checkout: CheckoutService,
    pub reconciler: PaymentReconciler,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::gateway::MockPaymentGateway;
    use crate::model::NewAccount;
    use crate::store::{AccountStore, MemoryStore};

    #[tokio::test]
    async fn test_purchase_then_spend_through_wired_services() {
        let store = Arc::new(MemoryStore::new());
        store.create_account(NewAccount::new("u1")).await.unwrap();

        let mut config = BillingConfig::default();
        for package in &mut config.catalog.packages {
            package.gateway_price_id = Some("price_starter".into());
        }
        let billing = Billing::new(config, store, Arc::new(SystemClock));
        let verifier = SignatureVerifier::new("whsec_test");
        let payments = billing.payments(Arc::new(MockPaymentGateway::new()), verifier.clone());

        let session = payments.checkout.create_points_checkout("u1", "starter").await.unwrap();
        let body = serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": { "id": session.session_id, "mode": "payment" } }
        })
        .to_string();
        let header = verifier.sign(body.as_bytes(), chrono::Utc::now().timestamp()).unwrap();
        payments.reconciler.process(body.as_bytes(), &header).await.unwrap();

        let summary = billing.admission.settle("u1", "gpt-5.2", 100_000, 10_000).await.unwrap();
        assert_eq!(summary.deducted, 158);
        assert_eq!(billing.queries.balance("u1").await.unwrap().points_balance, 3750 - 158);
    }
}
