//! Storage models for predictions and their lifecycle.

use crate::types::{ModelId, PredictionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Prediction lifecycle status, stored as TEXT in the database.
///
/// Transitions are monotonic: pending -> processing -> {completed, failed},
/// with pending -> failed allowed for pre-processing rejections. Nothing
/// ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PredictionStatus::Completed | PredictionStatus::Failed)
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PredictionStatus::Pending => "pending",
            PredictionStatus::Processing => "processing",
            PredictionStatus::Completed => "completed",
            PredictionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Request for creating a prediction.
///
/// `created_at` is optional so ingested legacy rows without a creation
/// timestamp stay representable; the producer path always stamps it.
#[derive(Debug, Clone)]
pub struct PredictionCreate {
    pub external_ref: Uuid,
    pub user_id: UserId,
    pub model_id: ModelId,
    pub input_text: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A prediction row. Created once by the producer, mutated only by the
/// ledger, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Prediction {
    pub id: PredictionId,
    /// Client-facing opaque token, distinct from the internal id
    pub external_ref: Uuid,
    pub user_id: UserId,
    pub model_id: ModelId,
    pub input_text: String,
    /// Completion text on success, diagnostic text on failure
    pub output_text: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    /// Per-token prices actually used at charge time, persisted so the
    /// cost stays reproducible after the model's prices change
    pub input_price: Option<Decimal>,
    pub output_price: Option<Decimal>,
    /// Amount actually charged (never the uncapped nominal value)
    pub cost: Option<Decimal>,
    /// Set when the charge was capped at the available balance
    pub cost_capped: bool,
    pub status: PredictionStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub queue_time_ms: Option<i64>,
    pub process_time_ms: Option<i64>,
}

impl Prediction {
    /// Queue latency at the moment processing starts: max(0, start - created_at).
    /// None (not an error) when the row has no creation timestamp.
    pub fn queue_time_ms_at(&self, processing_start: DateTime<Utc>) -> Option<i64> {
        self.created_at
            .map(|created| (processing_start - created).num_milliseconds().max(0))
    }
}

/// Full replacement of a prediction's mutable fields.
///
/// Writers start from the stored row via [`PredictionUpdate::from_row`] and
/// change only what moves, so unrelated fields survive the replace.
#[derive(Debug, Clone)]
pub struct PredictionUpdate {
    pub status: PredictionStatus,
    pub output_text: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub input_price: Option<Decimal>,
    pub output_price: Option<Decimal>,
    pub cost: Option<Decimal>,
    pub cost_capped: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub queue_time_ms: Option<i64>,
    pub process_time_ms: Option<i64>,
}

impl PredictionUpdate {
    pub fn from_row(prediction: &Prediction) -> Self {
        Self {
            status: prediction.status,
            output_text: prediction.output_text.clone(),
            input_tokens: prediction.input_tokens,
            output_tokens: prediction.output_tokens,
            input_price: prediction.input_price,
            output_price: prediction.output_price,
            cost: prediction.cost,
            cost_capped: prediction.cost_capped,
            completed_at: prediction.completed_at,
            queue_time_ms: prediction.queue_time_ms,
            process_time_ms: prediction.process_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(created_at: Option<DateTime<Utc>>) -> Prediction {
        Prediction {
            id: 1,
            external_ref: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            model_id: Uuid::new_v4(),
            input_text: "hi".to_string(),
            output_text: None,
            input_tokens: None,
            output_tokens: None,
            input_price: None,
            output_price: None,
            cost: None,
            cost_capped: false,
            status: PredictionStatus::Pending,
            created_at,
            completed_at: None,
            queue_time_ms: None,
            process_time_ms: None,
        }
    }

    #[test]
    fn queue_time_is_elapsed_millis() {
        let created = Utc::now();
        let p = row(Some(created));
        let start = created + chrono::Duration::milliseconds(250);
        assert_eq!(p.queue_time_ms_at(start), Some(250));
    }

    #[test]
    fn queue_time_clamps_clock_skew_to_zero() {
        let created = Utc::now();
        let p = row(Some(created));
        let start = created - chrono::Duration::milliseconds(40);
        assert_eq!(p.queue_time_ms_at(start), Some(0));
    }

    #[test]
    fn queue_time_is_none_without_created_at() {
        let p = row(None);
        assert_eq!(p.queue_time_ms_at(Utc::now()), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!PredictionStatus::Pending.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
        assert!(PredictionStatus::Completed.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
    }
}
