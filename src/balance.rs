//! Balance mutations with optimistic concurrency.
//!
//! Every balance write in the system is a version-checked compare-and-set;
//! there is no read-then-write path anywhere. Concurrent spenders serialize
//! through version misses and bounded retries, so the balance can never go
//! negative and no debit is ever lost.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;

use crate::errors::{Error, Resource, Result};
use crate::store::models::transaction::{Transaction, TransactionCreate};
use crate::store::{DbError, Storage};
use crate::types::UserId;

/// Debit and credit operations against user balances.
#[derive(Clone)]
pub struct BalanceAccount {
    storage: Arc<dyn Storage>,
    max_attempts: u32,
}

impl BalanceAccount {
    pub fn new(storage: Arc<dyn Storage>, max_attempts: u32) -> Self {
        Self {
            storage,
            max_attempts,
        }
    }

    /// Withdraw `amount`, guaranteeing `amount <= balance` at the instant
    /// of the write. Returns the new balance.
    ///
    /// Insufficient funds at any read aborts without retry; only version
    /// misses are retried, up to the configured attempt bound.
    #[instrument(skip(self), err)]
    pub async fn debit(&self, user_id: UserId, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(Error::Persistence(DbError::CheckViolation {
                constraint: None,
                table: None,
                message: format!("debit amount must be positive, got {amount}"),
            }));
        }

        for attempt in 1..=self.max_attempts {
            let user = self
                .storage
                .get_user(user_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    resource: Resource::User,
                    id: user_id.to_string(),
                })?;

            if user.balance < amount {
                return Err(Error::InsufficientFunds {
                    user_id,
                    requested: amount,
                    balance: user.balance,
                });
            }

            let new_balance = user.balance - amount;
            if self
                .storage
                .update_balance(user_id, new_balance, user.version)
                .await?
            {
                return Ok(new_balance);
            }
            tracing::debug!(%user_id, attempt, "balance version conflict, retrying debit");
        }

        Err(Error::Conflict {
            user_id,
            attempts: self.max_attempts,
        })
    }

    /// Record a top-up: a positive append-only transaction plus the
    /// version-checked balance increase, applied atomically by storage.
    #[instrument(skip(self), err)]
    pub async fn credit(
        &self,
        user_id: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(Error::Persistence(DbError::CheckViolation {
                constraint: None,
                table: None,
                message: format!("credit amount must be positive, got {amount}"),
            }));
        }

        for attempt in 1..=self.max_attempts {
            let user = self
                .storage
                .get_user(user_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    resource: Resource::User,
                    id: user_id.to_string(),
                })?;

            let create = TransactionCreate::credit(user_id, amount, description);
            match self
                .storage
                .add_transaction(&create, user.version, user.balance + amount)
                .await
            {
                Ok(transaction) => return Ok(transaction),
                Err(DbError::VersionConflict) => {
                    tracing::debug!(%user_id, attempt, "balance version conflict, retrying credit");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict {
            user_id,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserStore;
    use crate::store::memory::MemoryStore;
    use crate::test_utils::{VersionContention, seed_user};
    use futures::future::join_all;

    fn account(storage: Arc<dyn Storage>, max_attempts: u32) -> BalanceAccount {
        BalanceAccount::new(storage, max_attempts)
    }

    #[tokio::test]
    async fn debit_takes_from_balance() {
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(700, 2)).await;
        let account = account(storage.clone(), 5);

        let new_balance = account.debit(user.id, Decimal::new(500, 2)).await.unwrap();
        assert_eq!(new_balance, Decimal::new(200, 2));

        let stored = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::new(200, 2));
        assert_eq!(stored.version, user.version + 1);
    }

    #[tokio::test]
    async fn debit_rejects_insufficient_funds_without_write() {
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(100, 2)).await;
        let account = account(storage.clone(), 5);

        let err = account
            .debit(user.id, Decimal::new(500, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let stored = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::new(100, 2));
        assert_eq!(stored.version, user.version);
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        // Two 5.00 debits against 7.00: exactly one wins, the loser sees
        // the updated balance and reports insufficient funds
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(700, 2)).await;
        let account = account(storage.clone(), 5);

        let (a, b) = tokio::join!(
            account.debit(user.id, Decimal::new(500, 2)),
            account.debit(user.id, Decimal::new(500, 2)),
        );

        let outcomes = [a, b];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(
            outcomes
                .iter()
                .any(|r| matches!(r, Err(Error::InsufficientFunds { balance, .. })
                    if *balance == Decimal::new(200, 2)))
        );

        let stored = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::new(200, 2));
    }

    #[tokio::test]
    async fn contended_debits_drain_to_exactly_zero() {
        // Eight 1.00 debits against 5.00: five land, the rest see the
        // drained balance, and nothing is lost to interleaving
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(500, 2)).await;
        let account = account(storage.clone(), 32);

        let outcomes = join_all(
            (0..8).map(|_| account.debit(user.id, Decimal::new(100, 2))),
        )
        .await;

        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 5);
        assert!(
            outcomes
                .iter()
                .all(|r| matches!(r, Ok(_) | Err(Error::InsufficientFunds { .. })))
        );

        let stored = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn debit_survives_a_lost_race() {
        let contended = Arc::new(VersionContention::new(MemoryStore::new(), 1));
        let user = seed_user(contended.as_ref(), Decimal::new(1000, 2)).await;
        let account = account(contended.clone(), 5);

        let new_balance = account.debit(user.id, Decimal::new(300, 2)).await.unwrap();
        assert_eq!(new_balance, Decimal::new(700, 2));
    }

    #[tokio::test]
    async fn debit_gives_up_after_bounded_attempts() {
        let contended = Arc::new(VersionContention::new(MemoryStore::new(), u32::MAX));
        let user = seed_user(contended.as_ref(), Decimal::new(1000, 2)).await;
        let account = account(contended.clone(), 3);

        let err = account
            .debit(user.id, Decimal::new(100, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn debit_rejects_nonpositive_amounts() {
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(1000, 2)).await;
        let account = account(storage, 5);

        let err = account.debit(user.id, Decimal::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Persistence(DbError::CheckViolation { .. })
        ));
    }

    #[tokio::test]
    async fn debit_unknown_user_is_not_found() {
        let storage = Arc::new(MemoryStore::new());
        let account = account(storage, 5);

        let err = account
            .debit(uuid::Uuid::new_v4(), Decimal::ONE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                resource: Resource::User,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn credit_appends_transaction_and_raises_balance() {
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(100, 2)).await;
        let account = account(storage.clone(), 5);

        let tx = account
            .credit(user.id, Decimal::new(2500, 2), "card top-up")
            .await
            .unwrap();
        assert_eq!(tx.amount, Decimal::new(2500, 2));
        assert_eq!(tx.description, "card top-up");
        assert_eq!(tx.prediction_id, None);

        let stored = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::new(2600, 2));
    }

    #[tokio::test]
    async fn credit_retries_through_version_conflicts() {
        let contended = Arc::new(VersionContention::new(MemoryStore::new(), 2));
        let user = seed_user(contended.as_ref(), Decimal::new(100, 2)).await;
        let account = account(contended.clone(), 5);

        let tx = account
            .credit(user.id, Decimal::new(400, 2), "promo credit")
            .await
            .unwrap();
        assert_eq!(tx.amount, Decimal::new(400, 2));

        let stored = contended.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::new(500, 2));
    }

    #[tokio::test]
    async fn credit_rejects_nonpositive_amounts() {
        let storage = Arc::new(MemoryStore::new());
        let user = seed_user(storage.as_ref(), Decimal::new(100, 2)).await;
        let account = account(storage, 5);

        let err = account
            .credit(user.id, Decimal::new(-100, 2), "bogus")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Persistence(DbError::CheckViolation { .. })
        ));
    }
}
