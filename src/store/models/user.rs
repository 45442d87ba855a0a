//! Storage models for users.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Request for creating a new user
#[derive(Debug, Clone)]
pub struct UserCreate {
    pub display_name: String,
    /// Opaque identity from the upstream auth system (unique)
    pub external_id: String,
    /// Opening balance; must be non-negative
    pub balance: Decimal,
}

/// A user row.
///
/// `balance` is never written with a plain update: every balance write is
/// version-checked, and `version` increments each time it succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub external_id: String,
    pub balance: Decimal,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}
