//! Dispatch of accepted predictions into the durable job queue.

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::Result;
use crate::store::Storage;
use crate::store::models::job::{Job, JobCreate};
use crate::types::{PredictionId, UserId};

/// Hands accepted predictions to the processing side.
///
/// Delivery is at-least-once with no cross-job ordering guarantee; the
/// processing side owns idempotence.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn enqueue(
        &self,
        prediction_id: PredictionId,
        user_id: UserId,
        input_text: &str,
    ) -> Result<Job>;
}

/// Dispatcher backed by the storage layer's jobs table.
pub struct StoreDispatcher {
    storage: Arc<dyn Storage>,
}

impl StoreDispatcher {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobDispatcher for StoreDispatcher {
    async fn enqueue(
        &self,
        prediction_id: PredictionId,
        user_id: UserId,
        input_text: &str,
    ) -> Result<Job> {
        let job = self
            .storage
            .enqueue_job(&JobCreate {
                prediction_id,
                user_id,
                input_text: input_text.to_string(),
            })
            .await?;
        tracing::debug!(job_id = job.id, prediction_id, "enqueued prediction job");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn enqueued_jobs_are_immediately_claimable() {
        let storage = Arc::new(MemoryStore::new());
        let dispatcher = StoreDispatcher::new(storage.clone());

        let user_id = Uuid::new_v4();
        let job = dispatcher.enqueue(7, user_id, "tell me a story").await.unwrap();
        assert_eq!(job.prediction_id, 7);
        assert_eq!(job.attempt, 0);

        let claimed = storage
            .claim_jobs(10, Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].input_text, "tell me a story");
    }
}
