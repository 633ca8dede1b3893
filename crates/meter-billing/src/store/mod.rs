//! Persistence Ports
//!
//! Every balance and usage mutation is a single atomic operation at the
//! storage layer. Callers never read a value, decide, and write it back.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    Account, BillingException, DailyUsage, NewAccount, NewBillingException, NewSubscription,
    NewTransaction, PaymentTransaction, Subscription, SubscriptionPatch,
};

/// Outcome of a conditional points deduction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeductOutcome {
    Deducted { balance: i64 },

    /// Nothing was changed
    Insufficient { balance: i64 },

    AccountMissing,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Provision an account, returning the existing one if already present
    async fn create_account(&self, account: NewAccount) -> Result<Account>;

    async fn find_account(&self, id: &str) -> Result<Option<Account>>;

    /// Unconditional increment. `None` if the account does not exist.
    async fn add_points(&self, id: &str, amount: i64) -> Result<Option<i64>>;

    /// Decrement only if `balance >= amount`, in one step
    async fn deduct_points(&self, id: &str, amount: i64) -> Result<DeductOutcome>;

    /// Returns `false` if the account does not exist
    async fn mark_purchased(&self, id: &str) -> Result<bool>;

    /// First write wins. Returns `true` if this call bound the reference.
    async fn bind_customer_ref(&self, id: &str, customer_ref: &str) -> Result<bool>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a fresh active row. If the external reference already exists the
    /// stored row is returned unchanged.
    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription>;

    /// Most recent active subscription of the account
    async fn find_active_subscription(&self, account_id: &str) -> Result<Option<Subscription>>;

    async fn find_subscription_by_ref(&self, external_ref: &str) -> Result<Option<Subscription>>;

    async fn update_subscription(&self, id: Uuid, patch: SubscriptionPatch) -> Result<()>;

    /// Reset-and-charge on a new day, otherwise accumulate, in one step.
    /// Fails with `SubscriptionNotFound` for unknown ids.
    async fn increment_daily_points_used(
        &self,
        id: Uuid,
        amount: i64,
        today: NaiveDate,
    ) -> Result<DailyUsage>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a pending row keyed by session reference. On conflict the
    /// existing row is returned.
    async fn create_transaction(&self, transaction: NewTransaction) -> Result<PaymentTransaction>;

    async fn find_transaction_by_session(&self, session_ref: &str) -> Result<Option<PaymentTransaction>>;

    /// Newest first
    async fn list_transactions(&self, account_id: &str) -> Result<Vec<PaymentTransaction>>;

    /// pending -> completed, crediting `points_purchased` to the owning account
    /// and flagging it as a purchaser in the same step. Either everything is
    /// applied or nothing is. Returns whether this call performed the transition.
    async fn complete_purchase(
        &self,
        id: Uuid,
        payment_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// pending -> failed. Returns whether this call performed the transition.
    async fn mark_transaction_failed(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait ExceptionStore: Send + Sync {
    async fn record_exception(&self, exception: NewBillingException) -> Result<BillingException>;

    /// Newest first
    async fn list_exceptions(&self, limit: usize) -> Result<Vec<BillingException>>;
}

/// Short-lived values read exactly once
#[async_trait]
pub trait HandoffStore: Send + Sync {
    async fn put_handoff(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete-on-read. Expired entries are never returned.
    async fn take_handoff(&self, key: &str) -> Result<Option<String>>;
}

/// Everything a deployment needs from one backend
pub trait BillingStore:
    AccountStore + SubscriptionStore + TransactionStore + ExceptionStore + HandoffStore
{
}

impl<T> BillingStore for T where
    T: AccountStore + SubscriptionStore + TransactionStore + ExceptionStore + HandoffStore
{
}
