//! Storage models for queued billing jobs.

use crate::types::{JobId, PredictionId, UserId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Request for enqueuing a job
#[derive(Debug, Clone)]
pub struct JobCreate {
    pub prediction_id: PredictionId,
    pub user_id: UserId,
    pub input_text: String,
}

/// A queued job row.
///
/// Delivery is at-least-once: a claim takes a lease (`claimed_by`,
/// `lease_expires_at`), the owning worker heartbeats to extend it, and the
/// reconciliation sweep returns rows whose lease lapsed to the queue.
/// `attempt` counts deliberate retries only, not sweep recoveries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: JobId,
    pub prediction_id: PredictionId,
    pub user_id: UserId,
    pub input_text: String,
    pub attempt: i32,
    /// Earliest time the job may be claimed again (retry backoff)
    pub not_before: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether this row is visible to `claim_jobs` at `now`.
    pub fn claimable_at(&self, now: DateTime<Utc>) -> bool {
        let backoff_elapsed = self.not_before.is_none_or(|t| t <= now);
        let lease_lapsed = self.lease_expires_at.is_none_or(|t| t <= now);
        backoff_elapsed && (self.claimed_by.is_none() || lease_lapsed)
    }
}
