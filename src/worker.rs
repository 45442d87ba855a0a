//! Queue-consuming billing worker.
//!
//! Claims jobs in batches, runs each through [`Ledger::process`], and
//! settles the queue row according to the outcome. While a job runs, a
//! heartbeat task extends its lease so the expired-lease sweep only
//! reclaims work from workers that actually died. Redelivery is expected
//! under at-least-once delivery; the ledger's guarded writes make a
//! redelivered terminal prediction a read-only no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::errors::Result;
use crate::ledger::Ledger;
use crate::store::models::job::Job;
use crate::store::Storage;
use crate::types::{JobId, WorkerId};

pub struct Worker {
    worker_id: WorkerId,
    storage: Arc<dyn Storage>,
    ledger: Ledger,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(storage: Arc<dyn Storage>, ledger: Ledger, config: WorkerConfig) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            storage,
            ledger,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Main claim loop. Runs until `shutdown` is cancelled, then drains
    /// in-flight jobs for up to the configured grace period.
    #[tracing::instrument(skip(self, shutdown), fields(worker_id = %self.worker_id))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            claim_batch_size = self.config.claim_batch_size,
            max_concurrency = self.config.max_concurrency,
            "Worker starting"
        );

        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            // Poll for completed tasks (non-blocking)
            while let Some(result) = join_set.try_join_next() {
                match result {
                    Ok(()) => tracing::trace!("Job task completed"),
                    Err(join_error) => {
                        tracing::error!(error = %join_error, "Job task panicked");
                    }
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            // Hand back jobs whose workers died mid-lease
            match self.storage.release_expired_jobs().await {
                Ok(0) => {}
                Ok(released) => {
                    tracing::warn!(released, "Released jobs with expired leases");
                }
                Err(e) => tracing::error!(error = %e, "Expired-lease sweep failed"),
            }

            let in_flight = self.in_flight.load(Ordering::Relaxed);
            let capacity = self.config.max_concurrency.saturating_sub(in_flight);
            let batch = capacity.min(self.config.claim_batch_size);
            if batch == 0 {
                tracing::trace!(in_flight, "At concurrency limit, waiting for a slot");
                self.idle(&shutdown).await;
                continue;
            }

            let claimed = self
                .storage
                .claim_jobs(batch, self.worker_id, self.config.lease_duration)
                .await?;

            if claimed.is_empty() {
                tracing::trace!("No claimable jobs, sleeping");
                self.idle(&shutdown).await;
                continue;
            }

            tracing::debug!(claimed_count = claimed.len(), "Claimed jobs from storage");

            for job in claimed {
                // Count the slot before spawning so the next claim round
                // sees it taken.
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                let worker = Arc::clone(&self);
                join_set.spawn(async move {
                    let in_flight = Arc::clone(&worker.in_flight);
                    let _guard = scopeguard::guard((), move |_| {
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    worker.run_job(job).await;
                });
            }
        }

        if !join_set.is_empty() {
            tracing::info!(in_flight = join_set.len(), "Draining in-flight jobs");
        }
        let drain = async {
            while let Some(result) = join_set.join_next().await {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Job task panicked");
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = join_set.len(),
                "Shutdown grace elapsed, aborting remaining jobs"
            );
            join_set.shutdown().await;
        }

        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Process one claimed job end to end, then settle its queue row:
    /// ack on success, release with backoff on a retryable failure with
    /// attempts left, abandon the prediction and ack otherwise.
    async fn run_job(&self, job: Job) {
        tracing::info!(
            job_id = job.id,
            prediction_id = job.prediction_id,
            attempt = job.attempt,
            "Processing job"
        );

        let heartbeat = self.spawn_heartbeat(job.id);
        let outcome = self.ledger.process(job.prediction_id).await;
        heartbeat.abort();

        match outcome {
            Ok(prediction) => {
                tracing::info!(
                    job_id = job.id,
                    prediction_id = job.prediction_id,
                    status = ?prediction.status,
                    "Job completed"
                );
                self.ack(job.id).await;
            }
            Err(error) if error.is_retryable() && (job.attempt as u32) < self.config.max_retries => {
                let delay = self.backoff_delay(job.attempt);
                tracing::warn!(
                    job_id = job.id,
                    prediction_id = job.prediction_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, queued for retry"
                );
                let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                if let Err(e) = self.storage.release_job(job.id, job.attempt + 1, not_before).await
                {
                    // Leave the lease to lapse; the sweep requeues it
                    tracing::error!(job_id = job.id, error = %e, "Failed to release job for retry");
                }
            }
            Err(error) => {
                tracing::warn!(
                    job_id = job.id,
                    prediction_id = job.prediction_id,
                    attempt = job.attempt,
                    error = %error,
                    "Job failed permanently, abandoning"
                );
                if let Err(e) = self
                    .ledger
                    .abandon(job.prediction_id, &error.to_string())
                    .await
                {
                    tracing::error!(
                        prediction_id = job.prediction_id,
                        error = %e,
                        "Failed to abandon prediction"
                    );
                }
                self.ack(job.id).await;
            }
        }
    }

    /// Extend the job's lease on an interval for as long as the ledger
    /// runs. Stops on its own if the lease is lost, since the job may
    /// already belong to another worker.
    fn spawn_heartbeat(&self, job_id: JobId) -> JoinHandle<()> {
        let storage = self.storage.clone();
        let worker_id = self.worker_id;
        let lease = self.config.lease_duration;
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The claim itself granted a fresh lease; skip the immediate
            // first tick.
            interval.tick().await;
            loop {
                interval.tick().await;
                match storage.extend_job_lease(job_id, worker_id, lease).await {
                    Ok(true) => tracing::trace!(job_id, "Extended job lease"),
                    Ok(false) => {
                        tracing::warn!(job_id, "Job lease lost, stopping heartbeat");
                        break;
                    }
                    Err(e) => tracing::error!(job_id, error = %e, "Failed to extend job lease"),
                }
            }
        })
    }

    async fn ack(&self, job_id: JobId) {
        if let Err(e) = self.storage.finish_job(job_id).await {
            tracing::error!(job_id, error = %e, "Failed to finish job");
        }
    }

    /// Exponential backoff for the next delivery: `backoff * factor^attempt`,
    /// capped at `max_backoff`.
    fn backoff_delay(&self, attempt: i32) -> Duration {
        let factor = self
            .config
            .backoff_factor
            .saturating_pow(attempt.max(0) as u32);
        self.config
            .backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.claim_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::queue::StoreDispatcher;
    use crate::store::memory::MemoryStore;
    use crate::store::models::prediction::PredictionStatus;
    use crate::test_utils::{
        CountingPredictor, FailingPredictor, FixedPredictor, VersionContention, seed_model,
        seed_user,
    };
    use crate::types::PredictionId;
    use rust_decimal::Decimal;

    // Fast intervals so tests spend their time on assertions, not sleeps.
    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            claim_batch_size: 4,
            claim_interval: Duration::from_millis(10),
            lease_duration: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(100),
            max_concurrency: 4,
            max_retries: 2,
            backoff: Duration::from_millis(10),
            backoff_factor: 2,
            max_backoff: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn worker(
        storage: Arc<dyn Storage>,
        predictor: Arc<dyn crate::predictor::Predictor>,
        config: WorkerConfig,
    ) -> Arc<Worker> {
        let ledger = Ledger::builder()
            .storage(storage.clone())
            .predictor(predictor)
            .dispatcher(Arc::new(StoreDispatcher::new(storage.clone())))
            .settle_attempts(2)
            .build();
        Arc::new(Worker::new(storage, ledger, config))
    }

    async fn wait_for_terminal(storage: &dyn Storage, id: PredictionId) -> PredictionStatus {
        let start = tokio::time::Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            let prediction = storage
                .get_prediction(id)
                .await
                .expect("Failed to get prediction")
                .expect("Prediction should exist");
            if matches!(
                prediction.status,
                PredictionStatus::Completed | PredictionStatus::Failed
            ) {
                return prediction.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Prediction {id} did not reach a terminal status within timeout");
    }

    async fn wait_for_empty_queue(job_count: impl Fn() -> usize) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if job_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Queue did not drain within timeout");
    }

    #[test_log::test(tokio::test)]
    async fn submitted_predictions_complete_and_bill() {
        let memory = Arc::new(MemoryStore::new());
        let storage: Arc<dyn Storage> = memory.clone();
        let user = seed_user(storage.as_ref(), Decimal::new(1000, 2)).await;
        seed_model(storage.as_ref(), Decimal::new(1, 3), Decimal::new(2, 3)).await;

        let predictor = Arc::new(FixedPredictor::new("fixed output", 5, 10));
        let worker = worker(storage.clone(), predictor, fast_config());
        let ledger = worker.ledger.clone();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let prediction = ledger
            .submit(user.id, "what is the toll")
            .await
            .expect("Submit should succeed");

        let status = wait_for_terminal(storage.as_ref(), prediction.id).await;
        assert_eq!(status, PredictionStatus::Completed);
        wait_for_empty_queue(|| memory.job_count()).await;

        let settled = storage
            .get_prediction(prediction.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.output_text.as_deref(), Some("fixed output"));
        assert_eq!(settled.cost, Some(Decimal::new(25, 3)));

        let billed = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(billed.balance, Decimal::new(9975, 3));

        shutdown.cancel();
        handle
            .await
            .expect("Worker task should not panic")
            .expect("Worker should stop cleanly");
    }

    #[test_log::test(tokio::test)]
    async fn redelivered_jobs_do_not_rerun_terminal_predictions() {
        let memory = Arc::new(MemoryStore::new());
        let storage: Arc<dyn Storage> = memory.clone();
        let user = seed_user(storage.as_ref(), Decimal::new(1000, 2)).await;
        seed_model(storage.as_ref(), Decimal::new(1, 3), Decimal::new(2, 3)).await;

        // Transport faults mark the prediction failed on the spot, yet
        // classify as retryable. The redelivery must find the terminal row
        // and ack without touching the predictor again.
        let predictor = Arc::new(FailingPredictor::transport());
        let worker = worker(storage.clone(), predictor.clone(), fast_config());
        let ledger = worker.ledger.clone();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let prediction = ledger
            .submit(user.id, "doomed")
            .await
            .expect("Submit should succeed");

        let status = wait_for_terminal(storage.as_ref(), prediction.id).await;
        assert_eq!(status, PredictionStatus::Failed);
        wait_for_empty_queue(|| memory.job_count()).await;

        assert_eq!(predictor.calls(), 1);

        let failed = storage
            .get_prediction(prediction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(
            failed
                .output_text
                .as_deref()
                .is_some_and(|d| d.starts_with("Error:")),
            "output should carry the fault: {:?}",
            failed.output_text
        );
        assert!(failed.cost.is_none());

        // No money moved for a failed prediction
        let untouched = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(untouched.balance, Decimal::new(1000, 2));
        let transactions = storage
            .list_user_transactions(user.id, 0, 10)
            .await
            .unwrap();
        assert!(transactions.is_empty());

        shutdown.cancel();
        let _ = handle.await;
    }

    #[test_log::test(tokio::test)]
    async fn retries_exhaust_into_an_abandoned_prediction() {
        // Every settle hits a version conflict, so each delivery ends in a
        // retryable persistence error while the prediction stays live.
        let contention = Arc::new(VersionContention::new(MemoryStore::new(), u32::MAX));
        let storage: Arc<dyn Storage> = contention.clone();
        let user = seed_user(storage.as_ref(), Decimal::new(1000, 2)).await;
        seed_model(storage.as_ref(), Decimal::new(1, 2), Decimal::new(1, 2)).await;

        let predictor = Arc::new(CountingPredictor::new());
        let mut config = fast_config();
        config.max_retries = 1;
        let worker = worker(storage.clone(), predictor.clone(), config);
        let ledger = worker.ledger.clone();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let prediction = ledger
            .submit(user.id, "stuck settle")
            .await
            .expect("Submit should succeed");

        let status = wait_for_terminal(storage.as_ref(), prediction.id).await;
        assert_eq!(status, PredictionStatus::Failed);
        wait_for_empty_queue(|| contention.job_count()).await;

        // Initial delivery plus one retry, each rerunning the predictor
        // against the still-processing row.
        assert_eq!(predictor.calls(), 2);

        let abandoned = storage
            .get_prediction(prediction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(
            abandoned
                .output_text
                .as_deref()
                .is_some_and(|d| d.starts_with("Error:")),
            "output should carry the abandonment reason: {:?}",
            abandoned.output_text
        );
        assert!(abandoned.cost.is_none());

        // The charge never landed
        let untouched = storage.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(untouched.balance, Decimal::new(1000, 2));

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_worker_promptly() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let worker = worker(
            storage,
            Arc::new(CountingPredictor::new()),
            fast_config(),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("Worker should stop within the timeout")
            .expect("Worker task should not panic");
        assert!(result.is_ok());
    }
}
