//! Common type definitions.
//!
//! This module defines type aliases for entity identifiers:
//!
//! - [`UserId`] / [`ModelId`]: UUID-keyed entities
//! - [`PredictionId`] / [`TransactionId`] / [`JobId`]: internal numeric ids
//!   (the client-facing handle for a prediction is its `external_ref` UUID,
//!   never the internal id)
//! - [`WorkerId`]: identifies one worker process instance for job claims

use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type ModelId = Uuid;
pub type PredictionId = i64;
pub type TransactionId = i64;
pub type JobId = i64;
pub type WorkerId = Uuid;
