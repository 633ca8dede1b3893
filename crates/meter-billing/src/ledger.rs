//! Points Ledger
//!
//! Sole writer of an account's balance, purchase flag and customer reference.

use std::sync::Arc;

use crate::error::{BillingError, Result};
use crate::model::Account;
use crate::store::{AccountStore, DeductOutcome};

#[derive(Clone)]
pub struct PointsLedger {
    accounts: Arc<dyn AccountStore>,
}

impl PointsLedger {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    pub async fn account(&self, account_id: &str) -> Result<Option<Account>> {
        self.accounts.find_account(account_id).await
    }

    /// Credit points, returning the new balance
    pub async fn add_points(&self, account_id: &str, amount: i64) -> Result<i64> {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(amount));
        }
        let balance = self
            .accounts
            .add_points(account_id, amount)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))?;

        tracing::debug!(account_id = %account_id, amount, balance, "Points credited");
        Ok(balance)
    }

    /// Debit points only if the balance covers the amount.
    /// A refused debit leaves the balance untouched.
    pub async fn deduct_points(&self, account_id: &str, amount: i64) -> Result<i64> {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(amount));
        }
        match self.accounts.deduct_points(account_id, amount).await? {
            DeductOutcome::Deducted { balance } => {
                tracing::debug!(account_id = %account_id, amount, balance, "Points deducted");
                Ok(balance)
            }
            DeductOutcome::Insufficient { balance } => Err(BillingError::InsufficientBalance {
                needed: amount,
                available: balance,
            }),
            DeductOutcome::AccountMissing => Err(BillingError::AccountNotFound(account_id.to_string())),
        }
    }

    pub async fn mark_purchased(&self, account_id: &str) -> Result<()> {
        if self.accounts.mark_purchased(account_id).await? {
            Ok(())
        } else {
            Err(BillingError::AccountNotFound(account_id.to_string()))
        }
    }

    /// First write wins; later calls are no-ops
    pub async fn bind_customer_ref(&self, account_id: &str, customer_ref: &str) -> Result<()> {
        if self.accounts.bind_customer_ref(account_id, customer_ref).await? {
            tracing::info!(account_id = %account_id, customer_ref = %customer_ref, "Bound payment customer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewAccount;
    use crate::store::MemoryStore;

    async fn ledger_with_balance(balance: i64) -> PointsLedger {
        let store = Arc::new(MemoryStore::new());
        store.create_account(NewAccount::new("u1")).await.unwrap();
        let ledger = PointsLedger::new(store);
        ledger.add_points("u1", balance).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_rejected_deduction_leaves_balance() {
        let ledger = ledger_with_balance(100).await;

        let err = ledger.deduct_points("u1", 150).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientBalance { needed: 150, available: 100 }
        ));
        assert_eq!(ledger.account("u1").await.unwrap().unwrap().points_balance, 100);
    }

    #[tokio::test]
    async fn test_balance_never_negative_over_mixed_sequence() {
        let ledger = ledger_with_balance(30).await;

        for (credit, debit) in [(0, 20), (5, 20), (40, 10), (0, 100), (0, 45)] {
            ledger.add_points("u1", credit).await.unwrap();
            let before = ledger.account("u1").await.unwrap().unwrap().points_balance;
            match ledger.deduct_points("u1", debit).await {
                Ok(after) => assert_eq!(after, before - debit),
                Err(_) => {
                    let after = ledger.account("u1").await.unwrap().unwrap().points_balance;
                    assert_eq!(after, before);
                }
            }
            assert!(ledger.account("u1").await.unwrap().unwrap().points_balance >= 0);
        }
    }

    #[tokio::test]
    async fn test_negative_amounts_rejected() {
        let ledger = ledger_with_balance(10).await;
        assert!(matches!(
            ledger.add_points("u1", -5).await,
            Err(BillingError::InvalidAmount(-5))
        ));
        assert!(matches!(
            ledger.deduct_points("u1", -5).await,
            Err(BillingError::InvalidAmount(-5))
        ));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let ledger = PointsLedger::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            ledger.add_points("ghost", 5).await,
            Err(BillingError::AccountNotFound(_))
        ));
        assert!(matches!(
            ledger.mark_purchased("ghost").await,
            Err(BillingError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purchase_flag_and_customer_ref_are_sticky() {
        let ledger = ledger_with_balance(0).await;
        ledger.mark_purchased("u1").await.unwrap();
        ledger.mark_purchased("u1").await.unwrap();
        ledger.bind_customer_ref("u1", "cus_a").await.unwrap();
        ledger.bind_customer_ref("u1", "cus_b").await.unwrap();

        let account = ledger.account("u1").await.unwrap().unwrap();
        assert!(account.has_purchased);
        assert_eq!(account.payment_customer_ref.as_deref(), Some("cus_a"));
    }
}
