//! Payment Reconciliation
//!
//! Applies verified gateway events to transactions, subscriptions and the
//! points ledger. Every handler tolerates redelivery:
//!
//! - checkout completion claims the pending transaction and credits the points
//!   in one store step, so duplicates credit exactly once and a failed credit
//!   leaves the transaction pending for the next delivery
//! - a late expiry never touches a completed transaction
//! - subscription events for unknown references are no-ops

use serde::Serialize;
use std::sync::Arc;

use crate::catalog::BillingConfig;
use crate::clock::Clock;
use crate::error::Result;
use crate::gateway::PaymentGateway;
use crate::ledger::PointsLedger;
use crate::model::{
    NewBillingException, NewSubscription, NewTransaction, PaymentTransaction, SubscriptionPatch,
    SubscriptionStatus, TransactionStatus,
};
use crate::store::{ExceptionStore, SubscriptionStore, TransactionStore};
use crate::webhook::{
    CheckoutSessionObject, EventEnvelope, GatewayEvent, InvoiceObject, ObjectRef,
    SignatureVerifier, SubscriptionObject,
};

/// What applying one event did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,

    /// Redelivery of an event whose effect is already recorded
    AlreadyApplied,

    /// Nothing to do for this event
    Ignored,

    /// Event is well-formed but cannot be applied; nothing was written
    Rejected(String),
}

pub struct PaymentReconciler {
    config: Arc<BillingConfig>,
    ledger: PointsLedger,
    subscriptions: Arc<dyn SubscriptionStore>,
    transactions: Arc<dyn TransactionStore>,
    exceptions: Arc<dyn ExceptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
    clock: Arc<dyn Clock>,
}

impl PaymentReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BillingConfig>,
        ledger: PointsLedger,
        subscriptions: Arc<dyn SubscriptionStore>,
        transactions: Arc<dyn TransactionStore>,
        exceptions: Arc<dyn ExceptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: SignatureVerifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            subscriptions,
            transactions,
            exceptions,
            gateway,
            verifier,
            clock,
        }
    }

    /// Verify, decode and apply one webhook delivery
    pub async fn process(&self, payload: &[u8], signature: &str) -> Result<ReconcileOutcome> {
        if let Err(err) = self.verifier.verify(payload, signature, self.clock.now()) {
            tracing::warn!(error = %err, "Rejected webhook delivery");
            return Err(err);
        }
        let envelope = EventEnvelope::parse(payload)?;
        self.apply(&envelope).await
    }

    /// Apply already-verified payloads independently. One failing event does
    /// not stop the rest.
    pub async fn apply_batch(&self, payloads: &[Vec<u8>]) -> Vec<Result<ReconcileOutcome>> {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let result = match EventEnvelope::parse(payload) {
                Ok(envelope) => self.apply(&envelope).await,
                Err(err) => Err(err),
            };
            if let Err(err) = &result {
                tracing::error!(error = %err, "Event in batch failed");
            }
            results.push(result);
        }
        results
    }

    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<ReconcileOutcome> {
        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Processing Stripe webhook"
        );

        let outcome = match &envelope.event {
            GatewayEvent::CheckoutCompleted(session) => self.checkout_completed(session).await?,
            GatewayEvent::CheckoutExpired(session) => self.checkout_expired(session).await?,
            GatewayEvent::InvoicePaid(invoice) => self.invoice_paid(invoice).await?,
            GatewayEvent::SubscriptionUpdated(sub) => self.subscription_updated(sub).await?,
            GatewayEvent::SubscriptionDeleted(sub) => self.subscription_deleted(sub).await?,
            GatewayEvent::Unrecognized { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event");
                ReconcileOutcome::Ignored
            }
        };

        tracing::info!(event_id = %envelope.id, outcome = ?outcome, "Webhook applied");
        Ok(outcome)
    }

    async fn checkout_completed(&self, session: &CheckoutSessionObject) -> Result<ReconcileOutcome> {
        if session.is_subscription() {
            // Plan activations are driven by invoice.paid
            return Ok(ReconcileOutcome::Ignored);
        }

        let transaction = match self.transactions.find_transaction_by_session(&session.id).await? {
            Some(tx) => tx,
            None => match self.create_from_session(session).await? {
                Ok(tx) => tx,
                Err(reason) => return Ok(ReconcileOutcome::Rejected(reason)),
            },
        };

        match transaction.status {
            TransactionStatus::Completed => {
                self.bind_session_customer(&transaction, session).await?;
                return Ok(ReconcileOutcome::AlreadyApplied);
            }
            TransactionStatus::Failed => {
                let reason = format!("checkout {} completed after it was marked failed", session.id);
                self.record_exception(&transaction, &reason).await;
                return Ok(ReconcileOutcome::Rejected(reason));
            }
            TransactionStatus::Pending => {}
        }

        let payment_ref = session.payment_intent.as_ref().map(ObjectRef::id);
        let claimed = match self
            .transactions
            .complete_purchase(transaction.id, payment_ref, self.clock.now())
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                let reason = format!("credit failed for checkout {}: {err}", session.id);
                self.record_exception(&transaction, &reason).await;
                return Err(err);
            }
        };
        if !claimed {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        self.bind_session_customer(&transaction, session).await?;

        tracing::info!(
            account_id = %transaction.account_id,
            session_ref = %session.id,
            points = transaction.points_purchased,
            "Points purchase completed"
        );
        Ok(ReconcileOutcome::Applied)
    }

    /// First write wins, so repeating it on redelivery is harmless
    async fn bind_session_customer(
        &self,
        transaction: &PaymentTransaction,
        session: &CheckoutSessionObject,
    ) -> Result<()> {
        if let Some(customer) = &session.customer {
            self.ledger
                .bind_customer_ref(&transaction.account_id, customer.id())
                .await?;
        }
        Ok(())
    }

    /// Lazy path for a completion that arrives before the local pending row.
    /// The inner `Err` is a rejection reason.
    async fn create_from_session(
        &self,
        session: &CheckoutSessionObject,
    ) -> Result<std::result::Result<PaymentTransaction, String>> {
        let (Some(account_id), Some(package_id)) = (
            session.metadata_value("account_id"),
            session.metadata_value("package_id"),
        ) else {
            tracing::error!(session_ref = %session.id, "Checkout session is missing account or package metadata");
            return Ok(Err(format!("session {} lacks account/package metadata", session.id)));
        };

        let points = match session.metadata_value("points").map(str::parse::<i64>) {
            Some(Ok(points)) => points,
            Some(Err(_)) => {
                return Ok(Err(format!("session {} has invalid points metadata", session.id)));
            }
            None => match self.config.catalog.package(package_id) {
                Some(package) => package.points,
                None => return Ok(Err(format!("unknown package {package_id}"))),
            },
        };
        if points <= 0 {
            return Ok(Err(format!("session {} has invalid points metadata", session.id)));
        }

        if self.ledger.account(account_id).await?.is_none() {
            tracing::error!(account_id = %account_id, session_ref = %session.id, "Checkout for unknown account");
            return Ok(Err(format!("unknown account {account_id}")));
        }

        let transaction = self
            .transactions
            .create_transaction(NewTransaction {
                account_id: account_id.to_string(),
                external_session_ref: session.id.clone(),
                package_id: package_id.to_string(),
                points_purchased: points,
                amount_paid: session.amount_total.unwrap_or(0),
                currency: session.currency.clone().unwrap_or_else(|| "usd".into()),
                created_at: self.clock.now(),
            })
            .await?;

        tracing::info!(session_ref = %session.id, account_id = %account_id, "Created transaction from webhook");
        Ok(Ok(transaction))
    }

    async fn checkout_expired(&self, session: &CheckoutSessionObject) -> Result<ReconcileOutcome> {
        let Some(transaction) = self.transactions.find_transaction_by_session(&session.id).await? else {
            return Ok(ReconcileOutcome::Ignored);
        };

        if transaction.status != TransactionStatus::Pending {
            tracing::info!(
                session_ref = %session.id,
                status = %transaction.status.as_str(),
                "Expiry for settled checkout left untouched"
            );
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        if self.transactions.mark_transaction_failed(transaction.id).await? {
            Ok(ReconcileOutcome::Applied)
        } else {
            Ok(ReconcileOutcome::AlreadyApplied)
        }
    }

    async fn invoice_paid(&self, invoice: &InvoiceObject) -> Result<ReconcileOutcome> {
        let Some(subscription_ref) = invoice.subscription_ref() else {
            return Ok(ReconcileOutcome::Ignored);
        };

        let remote = self.gateway.retrieve_subscription(subscription_ref).await?;
        let period = remote.period_or_default(self.clock.now());

        if let Some(local) = self.subscriptions.find_subscription_by_ref(subscription_ref).await? {
            if local.status == SubscriptionStatus::Expired {
                tracing::info!(
                    subscription_ref = %subscription_ref,
                    "Invoice for expired subscription left untouched"
                );
                return Ok(ReconcileOutcome::AlreadyApplied);
            }

            self.subscriptions
                .update_subscription(
                    local.id,
                    SubscriptionPatch {
                        status: Some(SubscriptionStatus::Active),
                        period: Some(period),
                        cancel_at_period_end: Some(remote.cancel_at_period_end),
                    },
                )
                .await?;

            tracing::info!(
                subscription_ref = %subscription_ref,
                period_end = %period.end,
                "Subscription renewed"
            );
            return Ok(ReconcileOutcome::Applied);
        }

        let (Some(account_id), Some(plan_id)) = (
            remote.metadata_value("account_id"),
            remote.metadata_value("plan_id"),
        ) else {
            tracing::error!(subscription_ref = %subscription_ref, "Subscription is missing account or plan metadata");
            return Ok(ReconcileOutcome::Rejected(format!(
                "subscription {subscription_ref} lacks account/plan metadata"
            )));
        };

        let Some(plan) = self.config.catalog.plan(plan_id) else {
            tracing::error!(subscription_ref = %subscription_ref, plan_id = %plan_id, "Unknown plan in subscription metadata");
            return Ok(ReconcileOutcome::Rejected(format!("unknown plan {plan_id}")));
        };

        if self.ledger.account(account_id).await?.is_none() {
            tracing::error!(subscription_ref = %subscription_ref, account_id = %account_id, "Subscription for unknown account");
            return Ok(ReconcileOutcome::Rejected(format!("unknown account {account_id}")));
        }

        let customer_ref = remote
            .customer
            .as_ref()
            .or(invoice.customer.as_ref())
            .map(|c| c.id().to_string());

        let subscription = self
            .subscriptions
            .create_subscription(NewSubscription {
                account_id: account_id.to_string(),
                plan_id: plan.id.clone(),
                external_subscription_ref: subscription_ref.to_string(),
                payment_customer_ref: customer_ref.clone(),
                daily_points_limit: plan.daily_points_limit,
                period,
                today: self.clock.today(),
                created_at: self.clock.now(),
            })
            .await?;

        if let Some(customer_ref) = &customer_ref {
            self.ledger.bind_customer_ref(account_id, customer_ref).await?;
        }
        self.ledger.mark_purchased(account_id).await?;

        tracing::info!(
            account_id = %account_id,
            plan_id = %plan.id,
            subscription_id = %subscription.id,
            "Subscription activated"
        );
        Ok(ReconcileOutcome::Applied)
    }

    async fn subscription_updated(&self, remote: &SubscriptionObject) -> Result<ReconcileOutcome> {
        let Some(local) = self.subscriptions.find_subscription_by_ref(&remote.id).await? else {
            return Ok(ReconcileOutcome::Ignored);
        };
        if local.status == SubscriptionStatus::Expired {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let status = SubscriptionStatus::from_gateway(&remote.status);
        if status.is_none() {
            tracing::warn!(
                subscription_ref = %remote.id,
                status = %remote.status,
                "Unmapped subscription status, keeping local status"
            );
        }

        self.subscriptions
            .update_subscription(
                local.id,
                SubscriptionPatch {
                    status,
                    period: remote.period(),
                    cancel_at_period_end: Some(remote.cancel_at_period_end),
                },
            )
            .await?;
        Ok(ReconcileOutcome::Applied)
    }

    async fn subscription_deleted(&self, remote: &SubscriptionObject) -> Result<ReconcileOutcome> {
        let Some(local) = self.subscriptions.find_subscription_by_ref(&remote.id).await? else {
            return Ok(ReconcileOutcome::Ignored);
        };
        if local.status == SubscriptionStatus::Expired {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        self.subscriptions
            .update_subscription(
                local.id,
                SubscriptionPatch {
                    status: Some(SubscriptionStatus::Expired),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(account_id = %local.account_id, subscription_ref = %remote.id, "Subscription expired");
        Ok(ReconcileOutcome::Applied)
    }

    async fn record_exception(&self, transaction: &PaymentTransaction, reason: &str) {
        tracing::error!(
            account_id = %transaction.account_id,
            session_ref = %transaction.external_session_ref,
            points = transaction.points_purchased,
            reason = %reason,
            "Payment needs manual reconciliation"
        );

        let exception = NewBillingException {
            account_id: transaction.account_id.clone(),
            capability_id: None,
            cost: transaction.points_purchased,
            reason: reason.to_string(),
        };
        if let Err(e) = self.exceptions.record_exception(exception).await {
            tracing::error!(error = %e, "Failed to record billing exception");
        }
    }
}
