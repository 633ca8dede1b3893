//! PostgreSQL store
//!
//! Balance and usage mutations are single conditional statements so two
//! concurrent requests can never both pass a check made against stale data.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    AccountStore, DeductOutcome, ExceptionStore, HandoffStore, SubscriptionStore, TransactionStore,
};
use crate::error::{BillingError, Result};
use crate::model::{
    Account, BillingException, DailyUsage, NewAccount, NewBillingException, NewSubscription,
    NewTransaction, PaymentTransaction, Subscription, SubscriptionPatch, TransactionStatus,
};

const SUBSCRIPTION_COLUMNS: &str = "id, account_id, plan_id, status, external_subscription_ref, \
     payment_customer_ref, daily_points_limit, daily_points_used, last_usage_reset_date, \
     current_period_start, current_period_end, cancel_at_period_end, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, external_session_ref, package_id, \
     points_purchased, amount_paid, currency, status, payment_ref, created_at, completed_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(e.to_string()))
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: String,
    email: Option<String>,
    display_name: Option<String>,
    points_balance: i64,
    has_purchased: bool,
    payment_customer_ref: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            points_balance: row.points_balance,
            has_purchased: row.has_purchased,
            payment_customer_ref: row.payment_customer_ref,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    account_id: String,
    plan_id: String,
    status: String,
    external_subscription_ref: String,
    payment_customer_ref: Option<String>,
    daily_points_limit: i64,
    daily_points_used: i64,
    last_usage_reset_date: NaiveDate,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    cancel_at_period_end: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            account_id: row.account_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            external_subscription_ref: row.external_subscription_ref,
            payment_customer_ref: row.payment_customer_ref,
            daily_points_limit: row.daily_points_limit,
            daily_points_used: row.daily_points_used,
            last_usage_reset_date: row.last_usage_reset_date,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    account_id: String,
    external_session_ref: String,
    package_id: String,
    points_purchased: i64,
    amount_paid: i64,
    currency: String,
    status: String,
    payment_ref: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            account_id: row.account_id,
            external_session_ref: row.external_session_ref,
            package_id: row.package_id,
            points_purchased: row.points_purchased,
            amount_paid: row.amount_paid,
            currency: row.currency,
            status: row.status.parse()?,
            payment_ref: row.payment_ref,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow)]
struct ExceptionRow {
    id: Uuid,
    account_id: String,
    capability_id: Option<String>,
    cost: i64,
    reason: String,
    created_at: DateTime<Utc>,
}

impl From<ExceptionRow> for BillingException {
    fn from(row: ExceptionRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            capability_id: row.capability_id,
            cost: row.cost,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        sqlx::query(
            "INSERT INTO accounts (id, email, display_name) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&account.id)
        .bind(&account.email)
        .bind(&account.display_name)
        .execute(&self.pool)
        .await?;

        self.find_account(&account.id)
            .await?
            .ok_or(BillingError::AccountNotFound(account.id))
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, email, display_name, points_balance, has_purchased, \
             payment_customer_ref, created_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }

    async fn add_points(&self, id: &str, amount: i64) -> Result<Option<i64>> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts SET points_balance = points_balance + $2 \
             WHERE id = $1 RETURNING points_balance",
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn deduct_points(&self, id: &str, amount: i64) -> Result<DeductOutcome> {
        let deducted: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts SET points_balance = points_balance - $2 \
             WHERE id = $1 AND points_balance >= $2 RETURNING points_balance",
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(balance) = deducted {
            return Ok(DeductOutcome::Deducted { balance });
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT points_balance FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match current {
            Some(balance) => DeductOutcome::Insufficient { balance },
            None => DeductOutcome::AccountMissing,
        })
    }

    async fn mark_purchased(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET has_purchased = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bind_customer_ref(&self, id: &str, customer_ref: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET payment_customer_ref = $2 \
             WHERE id = $1 AND payment_customer_ref IS NULL",
        )
        .bind(id)
        .bind(customer_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let query = format!(
            "INSERT INTO subscriptions (id, account_id, plan_id, status, external_subscription_ref, \
             payment_customer_ref, daily_points_limit, daily_points_used, last_usage_reset_date, \
             current_period_start, current_period_end, created_at, updated_at) \
             VALUES ($1, $2, $3, 'active', $4, $5, $6, 0, $7, $8, $9, $10, $10) \
             ON CONFLICT (external_subscription_ref) DO NOTHING \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&new.account_id)
            .bind(&new.plan_id)
            .bind(&new.external_subscription_ref)
            .bind(&new.payment_customer_ref)
            .bind(new.daily_points_limit)
            .bind(new.today)
            .bind(new.period.start)
            .bind(new.period.end)
            .bind(new.created_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => row.try_into(),
            None => self
                .find_subscription_by_ref(&new.external_subscription_ref)
                .await?
                .ok_or(BillingError::SubscriptionNotFound(new.external_subscription_ref)),
        }
    }

    async fn find_active_subscription(&self, account_id: &str) -> Result<Option<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE account_id = $1 AND status = 'active' \
             ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_subscription_by_ref(&self, external_ref: &str) -> Result<Option<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_subscription_ref = $1"
        );
        sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn update_subscription(&self, id: Uuid, patch: SubscriptionPatch) -> Result<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET \
             status = COALESCE($2, status), \
             current_period_start = COALESCE($3, current_period_start), \
             current_period_end = COALESCE($4, current_period_end), \
             cancel_at_period_end = COALESCE($5, cancel_at_period_end), \
             updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.period.map(|p| p.start))
        .bind(patch.period.map(|p| p.end))
        .bind(patch.cancel_at_period_end)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::SubscriptionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn increment_daily_points_used(
        &self,
        id: Uuid,
        amount: i64,
        today: NaiveDate,
    ) -> Result<DailyUsage> {
        let row: Option<(i64, bool)> = sqlx::query_as(
            "UPDATE subscriptions AS s SET \
             daily_points_used = CASE WHEN prev.last_usage_reset_date <> $3 \
                 THEN $2 ELSE prev.daily_points_used + $2 END, \
             last_usage_reset_date = $3, \
             updated_at = NOW() \
             FROM (SELECT id, daily_points_used, last_usage_reset_date \
                   FROM subscriptions WHERE id = $1 FOR UPDATE) AS prev \
             WHERE s.id = prev.id \
             RETURNING s.daily_points_used, (prev.last_usage_reset_date <> $3) AS was_reset",
        )
        .bind(id)
        .bind(amount)
        .bind(today)
        .fetch_optional(&self.pool)
        .await?;

        let (daily_points_used, was_reset) =
            row.ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))?;
        Ok(DailyUsage {
            daily_points_used,
            was_reset,
        })
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn create_transaction(&self, new: NewTransaction) -> Result<PaymentTransaction> {
        let query = format!(
            "INSERT INTO payment_transactions (id, account_id, external_session_ref, package_id, \
             points_purchased, amount_paid, currency, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8) \
             ON CONFLICT (external_session_ref) DO NOTHING \
             RETURNING {TRANSACTION_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&new.account_id)
            .bind(&new.external_session_ref)
            .bind(&new.package_id)
            .bind(new.points_purchased)
            .bind(new.amount_paid)
            .bind(&new.currency)
            .bind(new.created_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => row.try_into(),
            None => self
                .find_transaction_by_session(&new.external_session_ref)
                .await?
                .ok_or(BillingError::TransactionNotFound(new.external_session_ref)),
        }
    }

    async fn find_transaction_by_session(&self, session_ref: &str) -> Result<Option<PaymentTransaction>> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE external_session_ref = $1"
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(session_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<PaymentTransaction>> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions \
             WHERE account_id = $1 ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PaymentTransaction::try_from)
            .collect()
    }

    async fn complete_purchase(
        &self,
        id: Uuid,
        payment_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<(String, i64)> = sqlx::query_as(
            "UPDATE payment_transactions SET status = $2, completed_at = $3, \
             payment_ref = COALESCE($4, payment_ref) \
             WHERE id = $1 AND status = $5 \
             RETURNING account_id, points_purchased",
        )
        .bind(id)
        .bind(TransactionStatus::Completed.as_str())
        .bind(at)
        .bind(payment_ref)
        .bind(TransactionStatus::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((account_id, points)) = claimed else {
            drop(tx);
            self.ensure_transaction_exists(id).await?;
            return Ok(false);
        };

        // Dropping `tx` without commit rolls the claim back
        let credited = sqlx::query(
            "UPDATE accounts SET points_balance = points_balance + $2, has_purchased = TRUE \
             WHERE id = $1",
        )
        .bind(&account_id)
        .bind(points)
        .execute(&mut *tx)
        .await?;
        if credited.rows_affected() == 0 {
            return Err(BillingError::AccountNotFound(account_id));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_transaction_failed(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payment_transactions SET status = $2 WHERE id = $1 AND status = $3",
        )
        .bind(id)
        .bind(TransactionStatus::Failed.as_str())
        .bind(TransactionStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.ensure_transaction_exists(id).await?;
        Ok(false)
    }
}

impl PgStore {
    async fn ensure_transaction_exists(&self, id: Uuid) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payment_transactions WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(())
        } else {
            Err(BillingError::TransactionNotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ExceptionStore for PgStore {
    async fn record_exception(&self, new: NewBillingException) -> Result<BillingException> {
        let row = sqlx::query_as::<_, ExceptionRow>(
            "INSERT INTO billing_exceptions (id, account_id, capability_id, cost, reason) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, account_id, capability_id, cost, reason, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&new.account_id)
        .bind(&new.capability_id)
        .bind(new.cost)
        .bind(&new.reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_exceptions(&self, limit: usize) -> Result<Vec<BillingException>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, ExceptionRow>(
            "SELECT id, account_id, capability_id, cost, reason, created_at \
             FROM billing_exceptions ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BillingException::from).collect())
    }
}

#[async_trait]
impl HandoffStore for PgStore {
    async fn put_handoff(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query("DELETE FROM handoff_tokens WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "INSERT INTO handoff_tokens (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now() + ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_handoff(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "DELETE FROM handoff_tokens WHERE key = $1 RETURNING value, expires_at",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(value, _)| value))
    }
}
