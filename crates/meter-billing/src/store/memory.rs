//! In-memory store (for development and tests)
//!
//! One mutex guards all tables, so each operation is atomic for the whole
//! read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AccountStore, DeductOutcome, ExceptionStore, HandoffStore, SubscriptionStore, TransactionStore,
};
use crate::error::{BillingError, Result};
use crate::model::{
    Account, BillingException, DailyUsage, NewAccount, NewBillingException, NewSubscription,
    NewTransaction, PaymentTransaction, Subscription, SubscriptionPatch, SubscriptionStatus,
    TransactionStatus,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    subscriptions: HashMap<Uuid, Subscription>,
    subscriptions_by_ref: HashMap<String, Uuid>,
    transactions: HashMap<Uuid, PaymentTransaction>,
    transactions_by_session: HashMap<String, Uuid>,
    exceptions: Vec<BillingException>,
    handoffs: HashMap<String, (String, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .accounts
            .entry(account.id.clone())
            .or_insert_with(|| Account {
                id: account.id,
                email: account.email,
                display_name: account.display_name,
                points_balance: 0,
                has_purchased: false,
                payment_customer_ref: None,
                created_at: Utc::now(),
            });
        Ok(stored.clone())
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>> {
        let tables = self.tables.lock().await;
        Ok(tables.accounts.get(id).cloned())
    }

    async fn add_points(&self, id: &str, amount: i64) -> Result<Option<i64>> {
        let mut tables = self.tables.lock().await;
        let Some(account) = tables.accounts.get_mut(id) else {
            return Ok(None);
        };
        account.points_balance = account
            .points_balance
            .checked_add(amount)
            .ok_or(BillingError::InvalidAmount(amount))?;
        Ok(Some(account.points_balance))
    }

    async fn deduct_points(&self, id: &str, amount: i64) -> Result<DeductOutcome> {
        let mut tables = self.tables.lock().await;
        let Some(account) = tables.accounts.get_mut(id) else {
            return Ok(DeductOutcome::AccountMissing);
        };
        if account.points_balance < amount {
            return Ok(DeductOutcome::Insufficient {
                balance: account.points_balance,
            });
        }
        account.points_balance -= amount;
        Ok(DeductOutcome::Deducted {
            balance: account.points_balance,
        })
    }

    async fn mark_purchased(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .accounts
            .get_mut(id)
            .map(|account| account.has_purchased = true)
            .is_some())
    }

    async fn bind_customer_ref(&self, id: &str, customer_ref: &str) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.accounts.get_mut(id) {
            Some(account) if account.payment_customer_ref.is_none() => {
                account.payment_customer_ref = Some(customer_ref.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let mut tables = self.tables.lock().await;
        if let Some(id) = tables.subscriptions_by_ref.get(&new.external_subscription_ref) {
            if let Some(existing) = tables.subscriptions.get(id) {
                return Ok(existing.clone());
            }
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            plan_id: new.plan_id,
            status: SubscriptionStatus::Active,
            external_subscription_ref: new.external_subscription_ref,
            payment_customer_ref: new.payment_customer_ref,
            daily_points_limit: new.daily_points_limit,
            daily_points_used: 0,
            last_usage_reset_date: new.today,
            current_period_start: new.period.start,
            current_period_end: new.period.end,
            cancel_at_period_end: false,
            created_at: new.created_at,
            updated_at: new.created_at,
        };

        tables
            .subscriptions_by_ref
            .insert(subscription.external_subscription_ref.clone(), subscription.id);
        tables.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn find_active_subscription(&self, account_id: &str) -> Result<Option<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.account_id == account_id && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_subscription_by_ref(&self, external_ref: &str) -> Result<Option<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions_by_ref
            .get(external_ref)
            .and_then(|id| tables.subscriptions.get(id))
            .cloned())
    }

    async fn update_subscription(&self, id: Uuid, patch: SubscriptionPatch) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let subscription = tables
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))?;

        if let Some(status) = patch.status {
            subscription.status = status;
        }
        if let Some(period) = patch.period {
            subscription.current_period_start = period.start;
            subscription.current_period_end = period.end;
        }
        if let Some(cancel) = patch.cancel_at_period_end {
            subscription.cancel_at_period_end = cancel;
        }
        subscription.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_daily_points_used(
        &self,
        id: Uuid,
        amount: i64,
        today: NaiveDate,
    ) -> Result<DailyUsage> {
        let mut tables = self.tables.lock().await;
        let subscription = tables
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))?;

        let was_reset = subscription.last_usage_reset_date != today;
        subscription.daily_points_used = if was_reset {
            amount
        } else {
            subscription
                .daily_points_used
                .checked_add(amount)
                .ok_or_else(|| BillingError::Storage("daily usage overflow".into()))?
        };
        subscription.last_usage_reset_date = today;
        subscription.updated_at = Utc::now();

        Ok(DailyUsage {
            daily_points_used: subscription.daily_points_used,
            was_reset,
        })
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn create_transaction(&self, new: NewTransaction) -> Result<PaymentTransaction> {
        let mut tables = self.tables.lock().await;
        if let Some(id) = tables.transactions_by_session.get(&new.external_session_ref) {
            if let Some(existing) = tables.transactions.get(id) {
                return Ok(existing.clone());
            }
        }

        let transaction = PaymentTransaction {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            external_session_ref: new.external_session_ref,
            package_id: new.package_id,
            points_purchased: new.points_purchased,
            amount_paid: new.amount_paid,
            currency: new.currency,
            status: TransactionStatus::Pending,
            payment_ref: None,
            created_at: new.created_at,
            completed_at: None,
        };

        tables
            .transactions_by_session
            .insert(transaction.external_session_ref.clone(), transaction.id);
        tables.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn find_transaction_by_session(&self, session_ref: &str) -> Result<Option<PaymentTransaction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transactions_by_session
            .get(session_ref)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<PaymentTransaction>> {
        let tables = self.tables.lock().await;
        let mut transactions: Vec<_> = tables
            .transactions
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    async fn complete_purchase(
        &self,
        id: Uuid,
        payment_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let transaction = tables
            .transactions
            .get(&id)
            .ok_or_else(|| BillingError::TransactionNotFound(id.to_string()))?;
        if transaction.status != TransactionStatus::Pending {
            return Ok(false);
        }
        let account_id = transaction.account_id.clone();
        let points = transaction.points_purchased;

        // Credit first so a missing account leaves the transaction pending
        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| BillingError::AccountNotFound(account_id.clone()))?;
        account.points_balance = account
            .points_balance
            .checked_add(points)
            .ok_or(BillingError::InvalidAmount(points))?;
        account.has_purchased = true;

        if let Some(transaction) = tables.transactions.get_mut(&id) {
            transaction.status = TransactionStatus::Completed;
            transaction.completed_at = Some(at);
            if let Some(payment_ref) = payment_ref {
                transaction.payment_ref = Some(payment_ref.to_string());
            }
        }
        Ok(true)
    }

    async fn mark_transaction_failed(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let transaction = tables
            .transactions
            .get_mut(&id)
            .ok_or_else(|| BillingError::TransactionNotFound(id.to_string()))?;

        if transaction.status != TransactionStatus::Pending {
            return Ok(false);
        }
        transaction.status = TransactionStatus::Failed;
        Ok(true)
    }
}

#[async_trait]
impl ExceptionStore for MemoryStore {
    async fn record_exception(&self, new: NewBillingException) -> Result<BillingException> {
        let mut tables = self.tables.lock().await;
        let exception = BillingException {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            capability_id: new.capability_id,
            cost: new.cost,
            reason: new.reason,
            created_at: Utc::now(),
        };
        tables.exceptions.push(exception.clone());
        Ok(exception)
    }

    async fn list_exceptions(&self, limit: usize) -> Result<Vec<BillingException>> {
        let tables = self.tables.lock().await;
        Ok(tables.exceptions.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl HandoffStore for MemoryStore {
    async fn put_handoff(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        tables.handoffs.retain(|_, (_, expires_at)| *expires_at > now);
        tables
            .handoffs
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn take_handoff(&self, key: &str) -> Result<Option<String>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .handoffs
            .remove(key)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(value, _)| value))
    }
}
