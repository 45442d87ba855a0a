//! The billing ledger: accepts predictions, runs them, and settles the
//! charge.
//!
//! `process` is the heart of the pipeline. It is safe against at-least-once
//! redelivery: terminal predictions are returned as-is without re-billing
//! or re-invoking the predictor, every status write is guarded by the
//! expected source status, and the final settle commits the prediction row,
//! the transaction, and the version-checked debit as one atomic storage
//! operation keyed on the row still being in processing.

use bon::Builder;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::errors::{Error, Resource, Result};
use crate::predictor::{Completion, Predictor};
use crate::pricing::PriceSchedule;
use crate::queue::JobDispatcher;
use crate::store::models::prediction::{
    Prediction, PredictionCreate, PredictionStatus, PredictionUpdate,
};
use crate::store::models::transaction::TransactionCreate;
use crate::store::{Charge, DbError, Storage};
use crate::types::{PredictionId, UserId};

/// Orchestrates the prediction lifecycle against its collaborators.
///
/// All dependencies are injected at construction:
///
/// ```rust,ignore
/// let ledger = Ledger::builder()
///     .storage(storage.clone())
///     .predictor(predictor)
///     .dispatcher(Arc::new(StoreDispatcher::new(storage)))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct Ledger {
    storage: Arc<dyn Storage>,
    predictor: Arc<dyn Predictor>,
    dispatcher: Arc<dyn JobDispatcher>,
    /// Bound on optimistic settle retries after balance races
    #[builder(default = 5)]
    settle_attempts: u32,
}

impl Ledger {
    /// Accept a prediction: verify the user and an active model exist,
    /// store the pending row, and enqueue a job for the workers.
    ///
    /// No balance check happens here; a broke user's prediction fails
    /// cheaply in [`process`](Ledger::process) before the predictor runs.
    #[instrument(skip(self, input_text), err)]
    pub async fn submit(&self, user_id: UserId, input_text: &str) -> Result<Prediction> {
        self.storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                resource: Resource::User,
                id: user_id.to_string(),
            })?;
        let model = self
            .storage
            .get_active_model()
            .await?
            .ok_or_else(|| Error::NotFound {
                resource: Resource::Model,
                id: "active".to_string(),
            })?;

        let prediction = self
            .storage
            .add_prediction(&PredictionCreate {
                external_ref: Uuid::new_v4(),
                user_id,
                model_id: model.id,
                input_text: input_text.to_string(),
                created_at: Some(Utc::now()),
            })
            .await?;
        self.dispatcher
            .enqueue(prediction.id, user_id, input_text)
            .await?;

        tracing::info!(
            prediction_id = prediction.id,
            external_ref = %prediction.external_ref,
            "accepted prediction"
        );
        Ok(prediction)
    }

    /// Run one prediction to a terminal state and settle the charge.
    ///
    /// Idempotent on terminal rows: re-invocation returns the stored state.
    /// Precondition failures (missing user or model, empty balance) are
    /// expected outcomes and come back as `Ok` with a failed prediction;
    /// only a missing *prediction* is the caller's error. Predictor faults
    /// mark the row failed and surface as [`Error::Predictor`] so the queue
    /// layer can classify them.
    #[instrument(skip(self), err)]
    pub async fn process(&self, prediction_id: PredictionId) -> Result<Prediction> {
        let prediction = self.load(prediction_id).await?;

        if prediction.status.is_terminal() {
            tracing::debug!(
                prediction_id,
                status = %prediction.status,
                "prediction already settled, returning stored state"
            );
            return Ok(prediction);
        }

        let Some(user) = self.storage.get_user(prediction.user_id).await? else {
            let diagnostic = format!("Error: user {} not found", prediction.user_id);
            return self.reject(prediction, diagnostic).await;
        };
        let Some(model) = self.storage.get_active_model().await? else {
            return self
                .reject(prediction, "Error: no active model".to_string())
                .await;
        };
        if user.balance <= Decimal::ZERO {
            return self
                .reject(prediction, "Error: insufficient balance".to_string())
                .await;
        }

        let processing_start = Utc::now();
        let prediction = match prediction.status {
            // Redelivery after a crash or sweep: the row already carries
            // its queue time, and re-persisting would miss the guard
            PredictionStatus::Processing => prediction,
            _ => {
                let mut update = PredictionUpdate::from_row(&prediction);
                update.status = PredictionStatus::Processing;
                update.queue_time_ms = prediction.queue_time_ms_at(processing_start);
                match self
                    .storage
                    .update_prediction(prediction.id, PredictionStatus::Pending, &update)
                    .await?
                {
                    Some(updated) => {
                        tracing::debug!(prediction_id, "prediction moved to processing");
                        updated
                    }
                    None => {
                        // Another worker got here first; follow its lead
                        let current = self.load(prediction_id).await?;
                        if current.status.is_terminal() {
                            return Ok(current);
                        }
                        current
                    }
                }
            }
        };

        let completion = match self.predictor.complete(&prediction.input_text).await {
            Ok(completion) => completion,
            Err(fault) => {
                let completed_at = Utc::now();
                tracing::warn!(prediction_id, error = %fault, "predictor fault");
                let mut update = PredictionUpdate::from_row(&prediction);
                update.status = PredictionStatus::Failed;
                update.output_text = Some(format!("Error: {fault}"));
                update.completed_at = Some(completed_at);
                update.process_time_ms =
                    Some((completed_at - processing_start).num_milliseconds().max(0));
                // A miss means another writer already settled the row;
                // either way nothing is billed
                self.storage
                    .update_prediction(prediction.id, PredictionStatus::Processing, &update)
                    .await?;
                return Err(Error::Predictor {
                    message: fault.to_string(),
                    permanent: fault.is_permanent(),
                });
            }
        };

        let completed_at = Utc::now();
        let process_time_ms = (completed_at - processing_start).num_milliseconds().max(0);
        let schedule = PriceSchedule::from(&model);
        self.settle(&prediction, &completion, &schedule, completed_at, process_time_ms)
            .await
    }

    /// Terminal escape hatch for the queue layer: mark a still-live
    /// prediction failed with a diagnostic. No-op on terminal rows.
    #[instrument(skip(self), err)]
    pub async fn abandon(&self, prediction_id: PredictionId, reason: &str) -> Result<Prediction> {
        let prediction = self.load(prediction_id).await?;
        if prediction.status.is_terminal() {
            return Ok(prediction);
        }

        tracing::warn!(prediction_id, reason, "abandoning prediction");
        let mut update = PredictionUpdate::from_row(&prediction);
        update.status = PredictionStatus::Failed;
        update.output_text = Some(format!("Error: {reason}"));
        update.completed_at = Some(Utc::now());
        match self
            .storage
            .update_prediction(prediction.id, prediction.status, &update)
            .await?
        {
            Some(updated) => Ok(updated),
            None => self.load(prediction_id).await,
        }
    }

    async fn load(&self, prediction_id: PredictionId) -> Result<Prediction> {
        self.storage
            .get_prediction(prediction_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                resource: Resource::Prediction,
                id: prediction_id.to_string(),
            })
    }

    /// Fail a prediction before any processing began. Expected outcome,
    /// so the failed row is returned as `Ok`.
    async fn reject(&self, prediction: Prediction, diagnostic: String) -> Result<Prediction> {
        tracing::warn!(
            prediction_id = prediction.id,
            %diagnostic,
            "rejecting prediction before processing"
        );
        let mut update = PredictionUpdate::from_row(&prediction);
        update.status = PredictionStatus::Failed;
        update.output_text = Some(diagnostic);
        update.completed_at = Some(Utc::now());
        match self
            .storage
            .update_prediction(prediction.id, prediction.status, &update)
            .await?
        {
            Some(updated) => Ok(updated),
            // Lost a race to another writer; whatever they wrote stands
            None => self.load(prediction.id).await,
        }
    }

    /// Commit the completed prediction, its transaction, and the debit as
    /// one unit, capping the charge at the balance read just before the
    /// write. A version conflict means someone else spent in between:
    /// re-read, re-cap, retry, bounded by `settle_attempts`.
    async fn settle(
        &self,
        prediction: &Prediction,
        completion: &Completion,
        schedule: &PriceSchedule,
        completed_at: chrono::DateTime<Utc>,
        process_time_ms: i64,
    ) -> Result<Prediction> {
        let nominal = schedule.nominal_cost(completion.input_tokens, completion.output_tokens);

        for attempt in 1..=self.settle_attempts {
            let user = self
                .storage
                .get_user(prediction.user_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    resource: Resource::User,
                    id: prediction.user_id.to_string(),
                })?;

            let chargeable = nominal.min(user.balance);
            let capped = chargeable < nominal;
            if capped {
                tracing::warn!(
                    prediction_id = prediction.id,
                    %nominal,
                    charged = %chargeable,
                    "balance below nominal cost, capping charge"
                );
            }

            let mut update = PredictionUpdate::from_row(prediction);
            update.status = PredictionStatus::Completed;
            update.output_text = Some(completion.output_text.clone());
            update.input_tokens = Some(completion.input_tokens);
            update.output_tokens = Some(completion.output_tokens);
            update.input_price = Some(schedule.input_price);
            update.output_price = Some(schedule.output_price);
            update.cost = Some(chargeable);
            update.cost_capped = capped;
            update.completed_at = Some(completed_at);
            update.process_time_ms = Some(process_time_ms);

            // A zero chargeable is an uncharged completion: no transaction
            let charge = if chargeable > Decimal::ZERO {
                Some(Charge {
                    transaction: TransactionCreate::charge(prediction, chargeable),
                    expected_version: user.version,
                    new_balance: user.balance - chargeable,
                })
            } else {
                None
            };

            match self
                .storage
                .settle_prediction(prediction.id, &update, charge.as_ref())
                .await
            {
                Ok(Some(settled)) => {
                    tracing::info!(
                        prediction_id = prediction.id,
                        cost = %chargeable,
                        capped,
                        "prediction settled"
                    );
                    return Ok(settled);
                }
                // Replay lost the settle race; the stored outcome stands
                Ok(None) => return self.load(prediction.id).await,
                Err(DbError::VersionConflict) => {
                    tracing::debug!(
                        prediction_id = prediction.id,
                        attempt,
                        "balance changed during settle, recomputing cap"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Persistence(DbError::Other(anyhow::anyhow!(
            "settle for prediction {} exhausted {} optimistic attempts",
            prediction.id,
            self.settle_attempts
        ))))
    }
}
