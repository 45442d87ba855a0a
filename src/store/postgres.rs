//! PostgreSQL storage adapter.
//!
//! The durable adapter for multi-process deployments. Claims use `FOR
//! UPDATE SKIP LOCKED` so concurrent workers never hand out the same job,
//! and the settle path runs its three writes inside one SQL transaction.
//! Queries go through the runtime API with explicit binds so the crate
//! builds without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
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

const SCHEMA: &str = include_str!("schema.sql");

const PREDICTION_COLUMNS: &str = "id, external_ref, user_id, model_id, input_text, output_text, \
     input_tokens, output_tokens, input_price, output_price, cost, cost_capped, status, \
     created_at, completed_at, queue_time_ms, process_time_ms";

const JOB_COLUMNS: &str = "id, prediction_id, user_id, input_text, attempt, not_before, \
     claimed_by, claimed_at, lease_expires_at, created_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self::new(pool);
        store.apply_schema().await?;
        Ok(store)
    }

    /// Idempotent schema application (CREATE TABLE IF NOT EXISTS throughout).
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn user_exists(&self, id: UserId) -> Result<bool> {
        let row: Option<(UserId,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn add_user(&self, user: &UserCreate) -> Result<User> {
        let row = sqlx::query_as::<_, User>(
            "INSERT INTO users (id, display_name, external_id, balance)
             VALUES ($1, $2, $3, $4)
             RETURNING id, display_name, external_id, balance, version, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&user.display_name)
        .bind(&user.external_id)
        .bind(user.balance)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, display_name, external_id, balance, version, created_at
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, display_name, external_id, balance, version, created_at
             FROM users WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_balance(
        &self,
        id: UserId,
        new_balance: Decimal,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET balance = $2, version = version + 1
             WHERE id = $1 AND version = $3",
        )
        .bind(id)
        .bind(new_balance)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish a stale version from a missing user
        match self.user_exists(id).await? {
            true => Ok(false),
            false => Err(DbError::NotFound),
        }
    }
}

#[async_trait]
impl ModelStore for PostgresStore {
    async fn add_model(&self, model: &ModelCreate) -> Result<Model> {
        let row = sqlx::query_as::<_, Model>(
            "INSERT INTO models (id, name, input_price, output_price, active)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, name, input_price, output_price, active, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&model.name)
        .bind(model.input_price)
        .bind(model.output_price)
        .bind(model.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_model(&self, id: ModelId) -> Result<Option<Model>> {
        let row = sqlx::query_as::<_, Model>(
            "SELECT id, name, input_price, output_price, active, created_at
             FROM models WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_active_model(&self) -> Result<Option<Model>> {
        let row = sqlx::query_as::<_, Model>(
            "SELECT id, name, input_price, output_price, active, created_at
             FROM models WHERE active = TRUE
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl PredictionStore for PostgresStore {
    async fn add_prediction(&self, prediction: &PredictionCreate) -> Result<Prediction> {
        let sql = format!(
            "INSERT INTO predictions (external_ref, user_id, model_id, input_text, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {PREDICTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Prediction>(&sql)
            .bind(prediction.external_ref)
            .bind(prediction.user_id)
            .bind(prediction.model_id)
            .bind(&prediction.input_text)
            .bind(prediction.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_prediction(&self, id: PredictionId) -> Result<Option<Prediction>> {
        let sql = format!("SELECT {PREDICTION_COLUMNS} FROM predictions WHERE id = $1");
        let row = sqlx::query_as::<_, Prediction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_prediction_by_external_ref(
        &self,
        external_ref: Uuid,
    ) -> Result<Option<Prediction>> {
        let sql = format!("SELECT {PREDICTION_COLUMNS} FROM predictions WHERE external_ref = $1");
        let row = sqlx::query_as::<_, Prediction>(&sql)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_prediction(
        &self,
        id: PredictionId,
        expected_status: PredictionStatus,
        update: &PredictionUpdate,
    ) -> Result<Option<Prediction>> {
        let sql = format!(
            "UPDATE predictions SET
                 status = $3, output_text = $4, input_tokens = $5, output_tokens = $6,
                 input_price = $7, output_price = $8, cost = $9, cost_capped = $10,
                 completed_at = $11, queue_time_ms = $12, process_time_ms = $13
             WHERE id = $1 AND status = $2
             RETURNING {PREDICTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Prediction>(&sql)
            .bind(id)
            .bind(expected_status)
            .bind(update.status)
            .bind(&update.output_text)
            .bind(update.input_tokens)
            .bind(update.output_tokens)
            .bind(update.input_price)
            .bind(update.output_price)
            .bind(update.cost)
            .bind(update.cost_capped)
            .bind(update.completed_at)
            .bind(update.queue_time_ms)
            .bind(update.process_time_ms)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_some() {
            return Ok(row);
        }
        // Distinguish a status-guard miss from a missing row
        match self.get_prediction(id).await? {
            Some(_) => Ok(None),
            None => Err(DbError::NotFound),
        }
    }

    async fn list_user_predictions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Prediction>> {
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions
             WHERE user_id = $1
             ORDER BY id DESC
             OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query_as::<_, Prediction>(&sql)
            .bind(user_id)
            .bind(skip)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    async fn add_transaction(
        &self,
        tx: &TransactionCreate,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<Transaction> {
        let mut db_tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE users SET balance = $2, version = version + 1
             WHERE id = $1 AND version = $3",
        )
        .bind(tx.user_id)
        .bind(new_balance)
        .bind(expected_version)
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.user_exists(tx.user_id).await? {
                true => Err(DbError::VersionConflict),
                false => Err(DbError::NotFound),
            };
        }

        let row = sqlx::query_as::<_, Transaction>(
            "INSERT INTO transactions (user_id, amount, description, prediction_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id, user_id, amount, description, prediction_id, created_at",
        )
        .bind(tx.user_id)
        .bind(tx.amount)
        .bind(&tx.description)
        .bind(tx.prediction_id)
        .fetch_one(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(row)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, Transaction>(
            "SELECT id, user_id, amount, description, prediction_id, created_at
             FROM transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn transaction_for_prediction(
        &self,
        prediction_id: PredictionId,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, Transaction>(
            "SELECT id, user_id, amount, description, prediction_id, created_at
             FROM transactions WHERE prediction_id = $1",
        )
        .bind(prediction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_user_transactions(
        &self,
        user_id: UserId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(
            "SELECT id, user_id, amount, description, prediction_id, created_at
             FROM transactions
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             OFFSET $2 LIMIT $3",
        )
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue_job(&self, job: &JobCreate) -> Result<Job> {
        let sql = format!(
            "INSERT INTO jobs (prediction_id, user_id, input_text)
             VALUES ($1, $2, $3)
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Job>(&sql)
            .bind(job.prediction_id)
            .bind(job.user_id)
            .bind(&job.input_text)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn claim_jobs(
        &self,
        limit: usize,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<Vec<Job>> {
        // Oldest-first pick under SKIP LOCKED so concurrent workers never
        // hand out the same row
        let sql = format!(
            "WITH claimable AS (
                 SELECT id FROM jobs
                 WHERE (claimed_by IS NULL OR lease_expires_at <= NOW())
                   AND (not_before IS NULL OR not_before <= NOW())
                 ORDER BY created_at, id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE jobs
             SET claimed_by = $2,
                 claimed_at = NOW(),
                 lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
             FROM claimable
             WHERE jobs.id = claimable.id
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, Job>(&sql)
            .bind(limit as i64)
            .bind(worker_id)
            .bind(lease.as_millis().to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn extend_job_lease(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease.as_millis().to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_job(
        &self,
        job_id: JobId,
        attempt: i32,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs
             SET attempt = $2, not_before = $3,
                 claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(attempt)
        .bind(not_before)
        .execute(&self.pool)
        .await?;
        match result.rows_affected() {
            0 => Err(DbError::NotFound),
            _ => Ok(()),
        }
    }

    async fn finish_job(&self, job_id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_expired_jobs(&self) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE jobs
             SET claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL
             WHERE claimed_by IS NOT NULL AND lease_expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl Storage for PostgresStore {
    async fn settle_prediction(
        &self,
        id: PredictionId,
        update: &PredictionUpdate,
        charge: Option<&Charge>,
    ) -> Result<Option<Prediction>> {
        let mut db_tx = self.pool.begin().await?;

        // Keyed on the row still being in processing; a replay rolls off here
        let sql = format!(
            "UPDATE predictions SET
                 status = $2, output_text = $3, input_tokens = $4, output_tokens = $5,
                 input_price = $6, output_price = $7, cost = $8, cost_capped = $9,
                 completed_at = $10, queue_time_ms = $11, process_time_ms = $12
             WHERE id = $1 AND status = $13
             RETURNING {PREDICTION_COLUMNS}"
        );
        let prediction = sqlx::query_as::<_, Prediction>(&sql)
            .bind(id)
            .bind(update.status)
            .bind(&update.output_text)
            .bind(update.input_tokens)
            .bind(update.output_tokens)
            .bind(update.input_price)
            .bind(update.output_price)
            .bind(update.cost)
            .bind(update.cost_capped)
            .bind(update.completed_at)
            .bind(update.queue_time_ms)
            .bind(update.process_time_ms)
            .bind(PredictionStatus::Processing)
            .fetch_optional(&mut *db_tx)
            .await?;

        let Some(prediction) = prediction else {
            if self.get_prediction(id).await?.is_none() {
                return Err(DbError::NotFound);
            }
            return Ok(None);
        };

        if let Some(charge) = charge {
            sqlx::query_as::<_, Transaction>(
                "INSERT INTO transactions (user_id, amount, description, prediction_id)
                 VALUES ($1, $2, $3, $4)
                 RETURNING id, user_id, amount, description, prediction_id, created_at",
            )
            .bind(charge.transaction.user_id)
            .bind(charge.transaction.amount)
            .bind(&charge.transaction.description)
            .bind(charge.transaction.prediction_id)
            .fetch_one(&mut *db_tx)
            .await?;

            let debited = sqlx::query(
                "UPDATE users SET balance = $2, version = version + 1
                 WHERE id = $1 AND version = $3",
            )
            .bind(charge.transaction.user_id)
            .bind(charge.new_balance)
            .bind(charge.expected_version)
            .execute(&mut *db_tx)
            .await?;

            if debited.rows_affected() == 0 {
                return Err(DbError::VersionConflict);
            }
        }

        db_tx.commit().await?;
        Ok(Some(prediction))
    }
}
