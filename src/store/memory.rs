//! Process-local storage adapter.
//!
//! Backs development runs and the behavior tests. Rows live in dashmaps;
//! every multi-row write (balance compare-and-sets, settles, job claims)
//! runs under a single mutex so the adapter honors the same atomicity
//! contracts as the Postgres adapter. Plain reads stay lock-free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::errors::{DbError, Result};
use super::models::job::{Job, JobCreate};
use super::models::model::{Model, ModelCreate};
use super::models::prediction::{Prediction, PredictionCreate, PredictionStatus, PredictionUpdate};
use super::models::transaction::{Transaction, TransactionCreate};
use super::models::user::{User, UserCreate};
use super::{Charge, JobStore, ModelStore, PredictionStore, Storage, TransactionStore, UserStore};
use crate::types::{JobId, ModelId, PredictionId, TransactionId, UserId, WorkerId};

#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, User>,
    models: DashMap<ModelId, Model>,
    predictions: DashMap<PredictionId, Prediction>,
    transactions: DashMap<TransactionId, Transaction>,
    jobs: DashMap<JobId, Job>,
    next_prediction_id: AtomicI64,
    next_transaction_id: AtomicI64,
    next_job_id: AtomicI64,
    // Serializes multi-row writes. Never held across an await.
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue depth, counting claimed but unacked jobs. Acked jobs are gone.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_violation(message: impl Into<String>) -> DbError {
        DbError::CheckViolation {
            constraint: Some("balance_non_negative".to_string()),
            table: Some("users".to_string()),
            message: message.into(),
        }
    }

    /// Balance write with the version compare-and-set. Caller holds the
    /// write lock.
    fn apply_balance(&self, id: UserId, new_balance: Decimal, expected_version: i64) -> Result<bool> {
        let Some(user) = self.users.get(&id).map(|r| r.clone()) else {
            return Err(DbError::NotFound);
        };
        if user.version != expected_version {
            return Ok(false);
        }
        if new_balance < Decimal::ZERO {
            return Err(Self::check_violation(format!(
                "balance for user {id} would become negative"
            )));
        }
        let mut updated = user;
        updated.balance = new_balance;
        updated.version += 1;
        self.users.insert(id, updated);
        Ok(true)
    }

    /// There is no rollback here, so everything a transaction-plus-balance
    /// write can reject is checked before the first map write. Caller holds
    /// the write lock.
    fn validate_charge(
        &self,
        tx: &TransactionCreate,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<()> {
        let Some(user) = self.users.get(&tx.user_id).map(|r| r.clone()) else {
            return Err(DbError::NotFound);
        };
        if user.version != expected_version {
            return Err(DbError::VersionConflict);
        }
        if new_balance < Decimal::ZERO {
            return Err(Self::check_violation(format!(
                "balance for user {} would become negative",
                tx.user_id
            )));
        }
        if let Some(prediction_id) = tx.prediction_id {
            if self
                .transactions
                .iter()
                .any(|r| r.prediction_id == Some(prediction_id))
            {
                return Err(DbError::UniqueViolation {
                    constraint: Some("transactions_prediction_id_key".to_string()),
                    table: Some("transactions".to_string()),
                    message: format!("prediction {prediction_id} already has a transaction"),
                });
            }
        }
        Ok(())
    }

    /// Append the transaction and apply the balance. Caller holds the write
    /// lock and has validated via [`Self::validate_charge`].
    fn write_charge(
        &self,
        tx: &TransactionCreate,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<Transaction> {
        let row = Transaction {
            id: Self::next_id(&self.next_transaction_id),
            user_id: tx.user_id,
            amount: tx.amount,
            description: tx.description.clone(),
            prediction_id: tx.prediction_id,
            created_at: Utc::now(),
        };
        self.transactions.insert(row.id, row.clone());
        self.apply_balance(tx.user_id, new_balance, expected_version)?;
        Ok(row)
    }

    fn apply_update(row: &mut Prediction, update: &PredictionUpdate) {
        row.status = update.status;
        row.output_text = update.output_text.clone();
        row.input_tokens = update.input_tokens;
        row.output_tokens = update.output_tokens;
        row.input_price = update.input_price;
        row.output_price = update.output_price;
        row.cost = update.cost;
        row.cost_capped = update.cost_capped;
        row.completed_at = update.completed_at;
        row.queue_time_ms = update.queue_time_ms;
        row.process_time_ms = update.process_time_ms;
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn add_user(&self, user: &UserCreate) -> Result<User> {
        let _guard = self.write_lock.lock().unwrap();
        if user.balance < Decimal::ZERO {
            return Err(Self::check_violation("opening balance must be non-negative"));
        }
        if self.users.iter().any(|r| r.external_id == user.external_id) {
            return Err(DbError::UniqueViolation {
                constraint: Some("users_external_id_key".to_string()),
                table: Some("users".to_string()),
                message: format!("external id {} already registered", user.external_id),
            });
        }
        let row = User {
            id: Uuid::new_v4(),
            display_name: user.display_name.clone(),
            external_id: user.external_id.clone(),
            balance: user.balance,
            version: 0,
            created_at: Utc::now(),
        };
        self.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.users.get(&id).map(|r| r.clone()))
    }

    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|r| r.external_id == external_id)
            .map(|r| r.clone()))
    }

    async fn update_balance(
        &self,
        id: UserId,
        new_balance: Decimal,
        expected_version: i64,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        self.apply_balance(id, new_balance, expected_version)
    }
}

#[async_trait]
impl ModelStore for MemoryStore {
    async fn add_model(&self, model: &ModelCreate) -> Result<Model> {
        let row = Model {
            id: Uuid::new_v4(),
            name: model.name.clone(),
            input_price: model.input_price,
            output_price: model.output_price,
            active: model.active,
            created_at: Utc::now(),
        };
        self.models.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_model(&self, id: ModelId) -> Result<Option<Model>> {
        Ok(self.models.get(&id).map(|r| r.clone()))
    }

    async fn get_active_model(&self) -> Result<Option<Model>> {
        // Newest active wins, matching the Postgres adapter's ordering
        let mut active: Vec<Model> = self
            .models
            .iter()
            .filter(|r| r.active)
            .map(|r| r.clone())
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active.into_iter().next())
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn add_prediction(&self, prediction: &PredictionCreate) -> Result<Prediction> {
        let _guard = self.write_lock.lock().unwrap();
        if self
            .predictions
            .iter()
            .any(|r| r.external_ref == prediction.external_ref)
        {
            return Err(DbError::UniqueViolation {
                constraint: Some("predictions_external_ref_key".to_string()),
                table: Some("predictions".to_string()),
                message: format!("external ref {} already exists", prediction.external_ref),
            });
        }
        let row = Prediction {
            id: Self::next_id(&self.next_prediction_id),
            external_ref: prediction.external_ref,
            user_id: prediction.user_id,
            model_id: prediction.model_id,
            input_text: prediction.input_text.clone(),
            output_text: None,
            input_tokens: None,
            output_tokens: None,
            input_price: None,
            output_price: None,
            cost: None,
            cost_capped: false,
            status: PredictionStatus::Pending,
            created_at: prediction.created_at,
            completed_at: None,
            queue_time_ms: None,
            process_time_ms: None,
        };
        self.predictions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_prediction(&self, id: PredictionId) -> Result<Option<Prediction>> {
        Ok(self.predictions.get(&id).map(|r| r.clone()))
    }

    async fn get_prediction_by_external_ref(
        &self,
        external_ref: Uuid,
    ) -> Result<Option<Prediction>> {
        Ok(self
            .predictions
            .iter()
            .find(|r| r.external_ref == external_ref)
            .map(|r| r.clone()))
    }

    async fn update_prediction(
        &self,
        id: PredictionId,
        expected_status: PredictionStatus,
        update: &PredictionUpdate,
    ) -> Result<Option<Prediction>> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut row) = self.predictions.get(&id).map(|r| r.clone()) else {
            return Err(DbError::NotFound);
        };
        if row.status != expected_status {
            return Ok(None);
        }
        Self::apply_update(&mut row, update);
        self.predictions.insert(id, row.clone());
        Ok(Some(row))
    }

    async fn list_user_predictions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Prediction>> {
        let mut rows: Vec<Prediction> = self
            .predictions
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn add_transaction(
        &self,
        tx: &TransactionCreate,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<Transaction> {
        let _guard = self.write_lock.lock().unwrap();
        self.validate_charge(tx, expected_version, new_balance)?;
        self.write_charge(tx, expected_version, new_balance)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.transactions.get(&id).map(|r| r.clone()))
    }

    async fn transaction_for_prediction(
        &self,
        prediction_id: PredictionId,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .find(|r| r.prediction_id == Some(prediction_id))
            .map(|r| r.clone()))
    }

    async fn list_user_transactions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let mut rows: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_job(&self, job: &JobCreate) -> Result<Job> {
        let row = Job {
            id: Self::next_id(&self.next_job_id),
            prediction_id: job.prediction_id,
            user_id: job.user_id,
            input_text: job.input_text.clone(),
            attempt: 0,
            not_before: None,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            created_at: Utc::now(),
        };
        self.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_jobs(
        &self,
        limit: usize,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<Vec<Job>> {
        let _guard = self.write_lock.lock().unwrap();
        let now = Utc::now();
        let mut claimable: Vec<Job> = self
            .jobs
            .iter()
            .filter(|r| r.claimable_at(now))
            .map(|r| r.clone())
            .collect();
        claimable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        claimable.truncate(limit);

        let lease_expires = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let mut claimed = Vec::with_capacity(claimable.len());
        for mut job in claimable {
            job.claimed_by = Some(worker_id);
            job.claimed_at = Some(now);
            job.lease_expires_at = Some(lease_expires);
            self.jobs.insert(job.id, job.clone());
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn extend_job_lease(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut job) = self.jobs.get(&job_id).map(|r| r.clone()) else {
            return Ok(false);
        };
        if job.claimed_by != Some(worker_id) {
            return Ok(false);
        }
        job.lease_expires_at = Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default());
        self.jobs.insert(job_id, job);
        Ok(true)
    }

    async fn release_job(
        &self,
        job_id: JobId,
        attempt: i32,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut job) = self.jobs.get(&job_id).map(|r| r.clone()) else {
            return Err(DbError::NotFound);
        };
        job.attempt = attempt;
        job.not_before = Some(not_before);
        job.claimed_by = None;
        job.claimed_at = None;
        job.lease_expires_at = None;
        self.jobs.insert(job_id, job);
        Ok(())
    }

    async fn finish_job(&self, job_id: JobId) -> Result<()> {
        self.jobs.remove(&job_id);
        Ok(())
    }

    async fn release_expired_jobs(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap();
        let now = Utc::now();
        let expired: Vec<Job> = self
            .jobs
            .iter()
            .filter(|r| r.claimed_by.is_some() && r.lease_expires_at.is_some_and(|t| t <= now))
            .map(|r| r.clone())
            .collect();
        let count = expired.len();
        for mut job in expired {
            job.claimed_by = None;
            job.claimed_at = None;
            job.lease_expires_at = None;
            self.jobs.insert(job.id, job);
        }
        Ok(count)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn settle_prediction(
        &self,
        id: PredictionId,
        update: &PredictionUpdate,
        charge: Option<&Charge>,
    ) -> Result<Option<Prediction>> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut row) = self.predictions.get(&id).map(|r| r.clone()) else {
            return Err(DbError::NotFound);
        };
        if row.status != PredictionStatus::Processing {
            return Ok(None);
        }
        if let Some(charge) = charge {
            self.validate_charge(&charge.transaction, charge.expected_version, charge.new_balance)?;
        }
        Self::apply_update(&mut row, update);
        self.predictions.insert(id, row.clone());
        if let Some(charge) = charge {
            self.write_charge(&charge.transaction, charge.expected_version, charge.new_balance)?;
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_create(balance: Decimal) -> UserCreate {
        UserCreate {
            display_name: "ada".to_string(),
            external_id: Uuid::new_v4().to_string(),
            balance,
        }
    }

    fn job_create(prediction_id: PredictionId) -> JobCreate {
        JobCreate {
            prediction_id,
            user_id: Uuid::new_v4(),
            input_text: "hello world".to_string(),
        }
    }

    #[tokio::test]
    async fn update_balance_checks_version() {
        let store = MemoryStore::new();
        let user = store.add_user(&user_create(Decimal::new(500, 2))).await.unwrap();

        assert!(store.update_balance(user.id, Decimal::new(300, 2), 0).await.unwrap());
        // Stale version is rejected
        assert!(!store.update_balance(user.id, Decimal::new(100, 2), 0).await.unwrap());

        let fresh = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(fresh.balance, Decimal::new(300, 2));
        assert_eq!(fresh.version, 1);
    }

    #[tokio::test]
    async fn update_balance_rejects_negative() {
        let store = MemoryStore::new();
        let user = store.add_user(&user_create(Decimal::ONE)).await.unwrap();
        let err = store
            .update_balance(user.id, Decimal::new(-1, 0), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::CheckViolation { .. }));
    }

    #[tokio::test]
    async fn duplicate_external_id_is_a_unique_violation() {
        let store = MemoryStore::new();
        let mut create = user_create(Decimal::ZERO);
        create.external_id = "ext-1".to_string();
        store.add_user(&create).await.unwrap();
        let err = store.add_user(&create).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn users_are_found_by_external_id() {
        let store = MemoryStore::new();
        let mut create = user_create(Decimal::new(250, 2));
        create.external_id = "chat-42".to_string();
        let user = store.add_user(&create).await.unwrap();

        let found = store
            .get_user_by_external_id("chat-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.get_user_by_external_id("chat-43").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn models_round_trip_by_id() {
        let store = MemoryStore::new();
        let model = store
            .add_model(&ModelCreate {
                name: "echo-large".to_string(),
                input_price: Decimal::new(1, 3),
                output_price: Decimal::new(2, 3),
                active: true,
            })
            .await
            .unwrap();

        let found = store.get_model(model.id).await.unwrap().unwrap();
        assert_eq!(found.name, "echo-large");
        assert_eq!(found.input_price, Decimal::new(1, 3));
        assert!(store.get_model(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn charges_are_found_by_id_and_by_prediction() {
        let store = MemoryStore::new();
        let user = store.add_user(&user_create(Decimal::new(500, 2))).await.unwrap();
        let tx = store
            .add_transaction(
                &TransactionCreate {
                    user_id: user.id,
                    amount: -Decimal::new(25, 3),
                    description: "Cost for prediction".to_string(),
                    prediction_id: Some(7),
                },
                0,
                Decimal::new(4975, 3),
            )
            .await
            .unwrap();

        let by_id = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(by_id.amount, -Decimal::new(25, 3));
        assert!(store.get_transaction(tx.id + 1).await.unwrap().is_none());

        let by_prediction = store.transaction_for_prediction(7).await.unwrap().unwrap();
        assert_eq!(by_prediction.id, tx.id);
        assert!(store.transaction_for_prediction(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prediction_pages_are_newest_first_per_user() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        for (owner, text) in [
            (user_id, "one"),
            (user_id, "two"),
            (other_id, "theirs"),
            (user_id, "three"),
        ] {
            store
                .add_prediction(&PredictionCreate {
                    external_ref: Uuid::new_v4(),
                    user_id: owner,
                    model_id: Uuid::new_v4(),
                    input_text: text.to_string(),
                    created_at: Some(Utc::now()),
                })
                .await
                .unwrap();
        }

        let first_page = store.list_user_predictions(user_id, 0, 2).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].input_text, "three");
        assert_eq!(first_page[1].input_text, "two");

        let second_page = store.list_user_predictions(user_id, 2, 2).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].input_text, "one");

        assert!(store.list_user_predictions(user_id, 3, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claims_take_a_lease_and_hide_the_job() {
        let store = MemoryStore::new();
        let job = store.enqueue_job(&job_create(1)).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let claimed = store.claim_jobs(10, a, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].claimed_by, Some(a));

        // Still leased: invisible to another worker
        let second = store.claim_jobs(10, b, Duration::from_secs(30)).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimable() {
        let store = MemoryStore::new();
        store.enqueue_job(&job_create(1)).await.unwrap();

        let a = Uuid::new_v4();
        let claimed = store.claim_jobs(10, a, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let released = store.release_expired_jobs().await.unwrap();
        assert_eq!(released, 1);

        let b = Uuid::new_v4();
        let reclaimed = store.claim_jobs(10, b, Duration::from_secs(30)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by, Some(b));
        // Sweep recovery does not count as a retry
        assert_eq!(reclaimed[0].attempt, 0);
    }

    #[tokio::test]
    async fn heartbeat_fails_after_losing_the_lease() {
        let store = MemoryStore::new();
        let job = store.enqueue_job(&job_create(1)).await.unwrap();

        let a = Uuid::new_v4();
        store.claim_jobs(10, a, Duration::ZERO).await.unwrap();
        store.release_expired_jobs().await.unwrap();
        let b = Uuid::new_v4();
        store.claim_jobs(10, b, Duration::from_secs(30)).await.unwrap();

        assert!(!store.extend_job_lease(job.id, a, Duration::from_secs(30)).await.unwrap());
        assert!(store.extend_job_lease(job.id, b, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn released_jobs_respect_not_before() {
        let store = MemoryStore::new();
        let job = store.enqueue_job(&job_create(1)).await.unwrap();
        let worker = Uuid::new_v4();
        store.claim_jobs(10, worker, Duration::from_secs(30)).await.unwrap();

        store
            .release_job(job.id, 1, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert!(store.claim_jobs(10, worker, Duration::from_secs(30)).await.unwrap().is_empty());

        store.release_job(job.id, 1, Utc::now()).await.unwrap();
        let claimed = store.claim_jobs(10, worker, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_age_order() {
        let store = MemoryStore::new();
        for i in 1..=3 {
            store.enqueue_job(&job_create(i)).await.unwrap();
        }
        let worker = Uuid::new_v4();
        let claimed = store.claim_jobs(2, worker, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].prediction_id, 1);
        assert_eq!(claimed[1].prediction_id, 2);
    }
}
