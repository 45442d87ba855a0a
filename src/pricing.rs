//! Tariff math for predictions.
//!
//! Prices are captured from the active model once, at the moment a
//! prediction enters processing, and travel with the charge from then on.
//! Later tariff edits never reprice work already in flight, and a settled
//! prediction's cost stays reproducible from its own row.

use rust_decimal::Decimal;

use crate::store::models::model::Model;

/// Per-token prices in effect for one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceSchedule {
    pub input_price: Decimal,
    pub output_price: Decimal,
}

impl From<&Model> for PriceSchedule {
    fn from(model: &Model) -> Self {
        Self {
            input_price: model.input_price,
            output_price: model.output_price,
        }
    }
}

impl PriceSchedule {
    /// The uncapped cost of a completion:
    /// `input_tokens * input_price + output_tokens * output_price`.
    ///
    /// Exact decimal arithmetic; what actually gets charged is this value
    /// capped at the payer's balance, which is the caller's business.
    pub fn nominal_cost(&self, input_tokens: i64, output_tokens: i64) -> Decimal {
        Decimal::from(input_tokens) * self.input_price
            + Decimal::from(output_tokens) * self.output_price
    }
}
