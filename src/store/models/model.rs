//! Storage models for inference models and their price schedules.

use crate::types::ModelId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Request for registering a model
#[derive(Debug, Clone)]
pub struct ModelCreate {
    pub name: String,
    /// Price per input token
    pub input_price: Decimal,
    /// Price per output token
    pub output_price: Decimal,
    pub active: bool,
}

/// A model row. Read-only to the billing path: the ledger resolves the
/// active model and copies its prices onto the prediction at charge time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub input_price: Decimal,
    pub output_price: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
