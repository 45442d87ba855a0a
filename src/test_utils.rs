//! Test utilities for exercising the pipeline (available with `test-utils` feature).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::predictor::echo::EchoPredictor;
use crate::predictor::{Completion, Predictor, PredictorError};
use crate::store::memory::MemoryStore;
use crate::store::models::job::{Job, JobCreate};
use crate::store::models::model::{Model, ModelCreate};
use crate::store::models::prediction::{
    Prediction, PredictionCreate, PredictionStatus, PredictionUpdate,
};
use crate::store::models::transaction::{Transaction, TransactionCreate};
use crate::store::models::user::{User, UserCreate};
use crate::store::{
    Charge, DbError, JobStore, ModelStore, PredictionStore, Storage, TransactionStore, UserStore,
};
use crate::types::{JobId, ModelId, PredictionId, TransactionId, UserId, WorkerId};

pub async fn seed_user(storage: &dyn Storage, balance: Decimal) -> User {
    storage
        .add_user(&UserCreate {
            display_name: "Ada Lovelace".to_string(),
            external_id: Uuid::new_v4().to_string(),
            balance,
        })
        .await
        .expect("Failed to seed user")
}

pub async fn seed_model(
    storage: &dyn Storage,
    input_price: Decimal,
    output_price: Decimal,
) -> Model {
    storage
        .add_model(&ModelCreate {
            name: "echo-large".to_string(),
            input_price,
            output_price,
            active: true,
        })
        .await
        .expect("Failed to seed model")
}

pub async fn seed_prediction(
    storage: &dyn Storage,
    user: &User,
    model: &Model,
    input: &str,
) -> Prediction {
    storage
        .add_prediction(&PredictionCreate {
            external_ref: Uuid::new_v4(),
            user_id: user.id,
            model_id: model.id,
            input_text: input.to_string(),
            created_at: Some(Utc::now()),
        })
        .await
        .expect("Failed to seed prediction")
}

/// Delegates to an echo backend while counting invocations, so tests can
/// assert the backend was called exactly never/once.
pub struct CountingPredictor {
    inner: EchoPredictor,
    calls: AtomicUsize,
}

impl CountingPredictor {
    pub fn new() -> Self {
        Self {
            inner: EchoPredictor::default(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for CountingPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Predictor for CountingPredictor {
    async fn complete(&self, input: &str) -> crate::predictor::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.complete(input).await
    }
}

/// Returns the same completion for every input.
pub struct FixedPredictor {
    completion: Completion,
}

impl FixedPredictor {
    pub fn new(output_text: &str, input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            completion: Completion {
                output_text: output_text.to_string(),
                input_tokens,
                output_tokens,
            },
        }
    }
}

#[async_trait]
impl Predictor for FixedPredictor {
    async fn complete(&self, _input: &str) -> crate::predictor::Result<Completion> {
        Ok(self.completion.clone())
    }
}

/// Always faults. Transport faults are retryable, malformed ones permanent.
pub struct FailingPredictor {
    permanent: bool,
    calls: AtomicUsize,
}

impl FailingPredictor {
    pub fn transport() -> Self {
        Self {
            permanent: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn malformed() -> Self {
        Self {
            permanent: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for FailingPredictor {
    async fn complete(&self, _input: &str) -> crate::predictor::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            Err(PredictorError::Malformed(
                "unparseable completion payload".to_string(),
            ))
        } else {
            Err(PredictorError::Transport(
                "connection reset by peer".to_string(),
            ))
        }
    }
}

/// Echo backend that blocks until the test releases it, one permit per
/// call. Lets tests observe mid-flight state (a prediction parked in
/// processing, a lease under heartbeat) deterministically.
pub struct GatedPredictor {
    gate: Semaphore,
    inner: EchoPredictor,
}

impl GatedPredictor {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            inner: EchoPredictor::default(),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

impl Default for GatedPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Predictor for GatedPredictor {
    async fn complete(&self, input: &str) -> crate::predictor::Result<Completion> {
        let permit = self.gate.acquire().await.expect("gate semaphore closed");
        permit.forget();
        self.inner.complete(input).await
    }
}

/// Storage wrapper that loses optimistic balance writes on purpose.
///
/// For the next `races` version-checked writes it first applies a competing
/// bump to the same user (optionally rewriting the balance via
/// [`set_race_balance`](VersionContention::set_race_balance)), so the
/// delegated write sees a stale version exactly as if another writer had won.
pub struct VersionContention {
    inner: MemoryStore,
    races: AtomicU32,
    race_balance: Mutex<Option<Decimal>>,
}

impl VersionContention {
    pub fn new(inner: MemoryStore, races: u32) -> Self {
        Self {
            inner,
            races: AtomicU32::new(races),
            race_balance: Mutex::new(None),
        }
    }

    /// The next injected race also rewrites the user's balance, simulating
    /// a competing spend rather than a pure version bump.
    pub fn set_race_balance(&self, balance: Decimal) {
        *self.race_balance.lock().expect("race_balance poisoned") = Some(balance);
    }

    pub fn job_count(&self) -> usize {
        self.inner.job_count()
    }

    fn take_race(&self) -> bool {
        let mut current = self.races.load(Ordering::SeqCst);
        while current > 0 {
            match self.races.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    async fn inject_race(&self, user_id: UserId) -> crate::store::Result<()> {
        if !self.take_race() {
            return Ok(());
        }
        let user = self
            .inner
            .get_user(user_id)
            .await?
            .ok_or(DbError::NotFound)?;
        let balance = self
            .race_balance
            .lock()
            .expect("race_balance poisoned")
            .take()
            .unwrap_or(user.balance);
        self.inner
            .update_balance(user_id, balance, user.version)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for VersionContention {
    async fn add_user(&self, user: &UserCreate) -> crate::store::Result<User> {
        self.inner.add_user(user).await
    }

    async fn get_user(&self, id: UserId) -> crate::store::Result<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn get_user_by_external_id(&self, external_id: &str) -> crate::store::Result<Option<User>> {
        self.inner.get_user_by_external_id(external_id).await
    }

    async fn update_balance(
        &self,
        id: UserId,
        new_balance: Decimal,
        expected_version: i64,
    ) -> crate::store::Result<bool> {
        self.inject_race(id).await?;
        self.inner
            .update_balance(id, new_balance, expected_version)
            .await
    }
}

#[async_trait]
impl ModelStore for VersionContention {
    async fn add_model(&self, model: &ModelCreate) -> crate::store::Result<Model> {
        self.inner.add_model(model).await
    }

    async fn get_model(&self, id: ModelId) -> crate::store::Result<Option<Model>> {
        self.inner.get_model(id).await
    }

    async fn get_active_model(&self) -> crate::store::Result<Option<Model>> {
        self.inner.get_active_model().await
    }
}

#[async_trait]
impl PredictionStore for VersionContention {
    async fn add_prediction(&self, prediction: &PredictionCreate) -> crate::store::Result<Prediction> {
        self.inner.add_prediction(prediction).await
    }

    async fn get_prediction(&self, id: PredictionId) -> crate::store::Result<Option<Prediction>> {
        self.inner.get_prediction(id).await
    }

    async fn get_prediction_by_external_ref(
        &self,
        external_ref: Uuid,
    ) -> crate::store::Result<Option<Prediction>> {
        self.inner.get_prediction_by_external_ref(external_ref).await
    }

    async fn update_prediction(
        &self,
        id: PredictionId,
        expected_status: PredictionStatus,
        update: &PredictionUpdate,
    ) -> crate::store::Result<Option<Prediction>> {
        self.inner
            .update_prediction(id, expected_status, update)
            .await
    }

    async fn list_user_predictions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> crate::store::Result<Vec<Prediction>> {
        self.inner.list_user_predictions(user_id, skip, limit).await
    }
}

#[async_trait]
impl TransactionStore for VersionContention {
    async fn add_transaction(
        &self,
        tx: &TransactionCreate,
        expected_version: i64,
        new_balance: Decimal,
    ) -> crate::store::Result<Transaction> {
        self.inject_race(tx.user_id).await?;
        self.inner
            .add_transaction(tx, expected_version, new_balance)
            .await
    }

    async fn get_transaction(&self, id: TransactionId) -> crate::store::Result<Option<Transaction>> {
        self.inner.get_transaction(id).await
    }

    async fn transaction_for_prediction(
        &self,
        prediction_id: PredictionId,
    ) -> crate::store::Result<Option<Transaction>> {
        self.inner.transaction_for_prediction(prediction_id).await
    }

    async fn list_user_transactions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> crate::store::Result<Vec<Transaction>> {
        self.inner.list_user_transactions(user_id, skip, limit).await
    }
}

#[async_trait]
impl JobStore for VersionContention {
    async fn enqueue_job(&self, job: &JobCreate) -> crate::store::Result<Job> {
        self.inner.enqueue_job(job).await
    }

    async fn claim_jobs(
        &self,
        limit: usize,
        worker_id: WorkerId,
        lease: Duration,
    ) -> crate::store::Result<Vec<Job>> {
        self.inner.claim_jobs(limit, worker_id, lease).await
    }

    async fn extend_job_lease(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease: Duration,
    ) -> crate::store::Result<bool> {
        self.inner.extend_job_lease(job_id, worker_id, lease).await
    }

    async fn release_job(
        &self,
        job_id: JobId,
        attempt: i32,
        not_before: DateTime<Utc>,
    ) -> crate::store::Result<()> {
        self.inner.release_job(job_id, attempt, not_before).await
    }

    async fn finish_job(&self, job_id: JobId) -> crate::store::Result<()> {
        self.inner.finish_job(job_id).await
    }

    async fn release_expired_jobs(&self) -> crate::store::Result<usize> {
        self.inner.release_expired_jobs().await
    }
}

#[async_trait]
impl Storage for VersionContention {
    async fn settle_prediction(
        &self,
        id: PredictionId,
        update: &PredictionUpdate,
        charge: Option<&Charge>,
    ) -> crate::store::Result<Option<Prediction>> {
        if let Some(charge) = charge {
            self.inject_race(charge.transaction.user_id).await?;
        }
        self.inner.settle_prediction(id, update, charge).await
    }
}
