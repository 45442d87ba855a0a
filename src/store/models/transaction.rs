//! Storage models for ledger transactions.

use super::prediction::Prediction;
use crate::types::{PredictionId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Request for appending a transaction.
///
/// Sign convention: negative = charge, positive = credit.
#[derive(Debug, Clone)]
pub struct TransactionCreate {
    pub user_id: UserId,
    pub amount: Decimal,
    pub description: String,
    pub prediction_id: Option<PredictionId>,
}

impl TransactionCreate {
    /// Charge for a prediction. `amount` is the (positive) chargeable cost;
    /// it is stored negated.
    pub fn charge(prediction: &Prediction, amount: Decimal) -> Self {
        Self {
            user_id: prediction.user_id,
            amount: -amount,
            description: format!("Cost for prediction {}", prediction.external_ref),
            prediction_id: Some(prediction.id),
        }
    }

    /// Credit (top-up) for a user. `amount` is positive and stored as-is.
    pub fn credit(user_id: UserId, amount: Decimal, description: impl Into<String>) -> Self {
        Self {
            user_id,
            amount,
            description: description.into(),
            prediction_id: None,
        }
    }
}

/// A transaction row. Immutable once created; the table is append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub description: String,
    /// At most one transaction may reference a given prediction
    pub prediction_id: Option<PredictionId>,
    pub created_at: DateTime<Utc>,
}
