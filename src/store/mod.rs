//! Storage layer: repository contracts and interchangeable adapters.
//!
//! One storage-agnostic interface ([`Storage`], composed of per-entity
//! traits) with two adapters selected by configuration:
//!
//! - [`memory::MemoryStore`]: process-local, for development and tests
//! - [`postgres::PostgresStore`]: durable, shared across processes
//!
//! # Consistency contracts
//!
//! The billing invariants live at this seam, not in the adapters' callers:
//!
//! - Balance writes are version-checked compare-and-sets. A missed check
//!   surfaces as `Ok(false)` ([`UserStore::update_balance`]) or
//!   [`DbError::VersionConflict`] (composite writes), never as a lost
//!   update.
//! - Prediction updates are status-guarded: the write applies only while
//!   the row is still in the expected source state, so a lost race
//!   surfaces as `None` instead of a backward transition.
//! - [`Storage::settle_prediction`] applies the terminal prediction
//!   fields, the charge transaction, and the balance debit as one atomic
//!   unit, keyed by the prediction still being in `processing`.
//! - Job claims take a lease; expired leases are reclaimed by
//!   [`JobStore::release_expired_jobs`], never by guessing at liveness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use uuid::Uuid;

pub mod errors;
pub mod memory;
pub mod models;
pub mod postgres;

pub use errors::{DbError, Result};

use crate::types::{JobId, ModelId, PredictionId, TransactionId, UserId, WorkerId};
use models::job::{Job, JobCreate};
use models::model::{Model, ModelCreate};
use models::prediction::{Prediction, PredictionCreate, PredictionStatus, PredictionUpdate};
use models::transaction::{Transaction, TransactionCreate};
use models::user::{User, UserCreate};

/// User rows and the version-checked balance write.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn add_user(&self, user: &UserCreate) -> Result<User>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>>;

    /// Write `new_balance` iff the row's version still equals
    /// `expected_version`, bumping the version on success. Returns false on
    /// a version miss; errors with [`DbError::NotFound`] when the user does
    /// not exist.
    async fn update_balance(
        &self,
        id: UserId,
        new_balance: Decimal,
        expected_version: i64,
    ) -> Result<bool>;
}

/// Model rows. Read-only to the billing path.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn add_model(&self, model: &ModelCreate) -> Result<Model>;

    async fn get_model(&self, id: ModelId) -> Result<Option<Model>>;

    /// The model predictions are billed against, or None when no model is
    /// active.
    async fn get_active_model(&self) -> Result<Option<Model>>;
}

/// Prediction rows and the status-guarded update.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn add_prediction(&self, prediction: &PredictionCreate) -> Result<Prediction>;

    async fn get_prediction(&self, id: PredictionId) -> Result<Option<Prediction>>;

    async fn get_prediction_by_external_ref(&self, external_ref: Uuid)
    -> Result<Option<Prediction>>;

    /// Replace the row's mutable fields iff its status still equals
    /// `expected_status`. `None` means the guard missed (another writer got
    /// there first); callers reload and decide. Errors with
    /// [`DbError::NotFound`] when the row does not exist.
    async fn update_prediction(
        &self,
        id: PredictionId,
        expected_status: PredictionStatus,
        update: &PredictionUpdate,
    ) -> Result<Option<Prediction>>;

    /// Newest-first page of a user's predictions.
    async fn list_user_predictions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Prediction>>;
}

/// Append-only transaction rows.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Append a transaction and apply the matching version-checked balance
    /// write as one atomic unit. Errors with [`DbError::VersionConflict`]
    /// when the user's version moved since it was read.
    async fn add_transaction(
        &self,
        tx: &TransactionCreate,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<Transaction>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;

    /// The charge recorded for a prediction, if any. At most one exists.
    async fn transaction_for_prediction(
        &self,
        prediction_id: PredictionId,
    ) -> Result<Option<Transaction>>;

    /// Newest-first page of a user's transactions.
    async fn list_user_transactions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>>;
}

/// Durable at-least-once job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue_job(&self, job: &JobCreate) -> Result<Job>;

    /// Atomically claim up to `limit` claimable jobs (unclaimed or
    /// lease-expired, `not_before` elapsed) for `worker_id`, leasing each
    /// until now + `lease`.
    async fn claim_jobs(&self, limit: usize, worker_id: WorkerId, lease: Duration)
    -> Result<Vec<Job>>;

    /// Heartbeat: extend the lease of a job this worker owns. Returns false
    /// when the job is gone or no longer owned by `worker_id`.
    async fn extend_job_lease(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<bool>;

    /// Return a job to the queue for retry attempt `attempt`, invisible to
    /// claims until `not_before`.
    async fn release_job(&self, job_id: JobId, attempt: i32, not_before: DateTime<Utc>)
    -> Result<()>;

    /// Acknowledge (delete) a job.
    async fn finish_job(&self, job_id: JobId) -> Result<()>;

    /// Reconciliation sweep: make jobs with lapsed leases claimable again,
    /// leaving their attempt count unchanged. Returns how many were
    /// released.
    async fn release_expired_jobs(&self) -> Result<usize>;
}

/// The financial half of a settle: the transaction to append plus the
/// version-checked balance write that pays for it.
#[derive(Debug, Clone)]
pub struct Charge {
    pub transaction: TransactionCreate,
    pub expected_version: i64,
    pub new_balance: Decimal,
}

/// Combined storage interface the application is wired against.
#[async_trait]
pub trait Storage:
    UserStore + ModelStore + PredictionStore + TransactionStore + JobStore + Send + Sync
{
    /// Commit a finished processing pass as one atomic unit, in order:
    /// prediction terminal fields, charge transaction, balance debit.
    ///
    /// The whole write is keyed by the prediction still being in
    /// `processing`: `Ok(None)` means it no longer is (a replay lost the
    /// race) and nothing was written. [`DbError::VersionConflict`] means
    /// the balance version moved; the caller re-reads, re-caps, and
    /// retries. `charge` is None for uncharged completions (chargeable
    /// amount of zero), which settle without touching the user row.
    async fn settle_prediction(
        &self,
        id: PredictionId,
        update: &PredictionUpdate,
        charge: Option<&Charge>,
    ) -> Result<Option<Prediction>>;
}
