//! # tollbooth: Prediction Billing Pipeline
//!
//! `tollbooth` runs prediction requests through a metered pipeline: clients
//! submit inputs against priced models, a queue-backed worker executes each
//! prediction, and the outcome is settled against the owner's prepaid
//! balance in the same atomic write that records the result. It exists for
//! platforms that resell model inference and cannot afford to lose money to
//! crashes, redeliveries, or concurrent spending.
//!
//! ## Overview
//!
//! Every prediction belongs to a user with a decimal balance and is priced
//! by a model's per-token rates. Submission is cheap: it records a pending
//! prediction and enqueues a job, and billing happens later, when a worker
//! picks the job up. The pipeline promises at-least-once execution with
//! at-most-once billing: a job may be delivered to workers any number of
//! times, but the balance debit for a prediction is written exactly once,
//! in the same transaction that marks the prediction terminal.
//!
//! ### Request Flow
//!
//! A submission writes a pending prediction row and a queue job. A worker
//! claims the job under a lease, marks the prediction processing, runs the
//! predictor backend, prices the token counts it reports, and settles:
//! result fields, the charge transaction, and the balance debit commit
//! atomically, guarded by the prediction still being in the processing
//! state. Charges are capped at whatever balance remains at settle time,
//! so concurrent spending can shrink a charge but never drive a balance
//! negative. Faults mark the prediction failed without moving money.
//!
//! ### Core Components
//!
//! The **storage layer** ([`store`]) abstracts persistence behind
//! per-entity traits with postgres and in-process memory adapters. All
//! billing writes go through version-checked balance updates, so every
//! adapter surfaces lost races the same way.
//!
//! The **ledger** ([`ledger`]) owns prediction lifecycle semantics:
//! submission, processing, settlement, and abandonment. It is the only
//! component that moves money for predictions.
//!
//! The **worker** ([`worker`]) drives the queue: batched claims, lease
//! heartbeats, exponential backoff on retryable failures, and graceful
//! drain on shutdown.
//!
//! The **balance account** ([`balance`]) serves direct credits and debits
//! (top-ups, refunds, manual adjustments) with bounded optimistic retries.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use tollbooth::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Parse CLI arguments and load configuration
//!     let args = tollbooth::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     // Initialize structured logging
//!     tollbooth::telemetry::init_telemetry()?;
//!
//!     // Create and start the pipeline
//!     let app = Application::new(config).await?;
//!
//!     // Run with graceful shutdown on Ctrl+C
//!     app.run(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod balance;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod predictor;
pub mod pricing;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

pub use crate::config::Config;
use crate::config::StorageConfig;
use crate::ledger::Ledger;
use crate::predictor::create_predictor;
use crate::queue::StoreDispatcher;
use crate::store::Storage;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PostgresStore;
use crate::worker::Worker;

/// Handles for the tasks that run alongside the pipeline.
///
/// # Graceful Shutdown
///
/// The struct provides a [`shutdown`](BackgroundServices::shutdown) method to gracefully
/// stop all background tasks. When dropped, the `drop_guard` will automatically cancel
/// the shutdown token, signaling all tasks to stop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        // Signal all background tasks to shutdown
        self.shutdown_token.cancel();

        // Wait for all background tasks to complete
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Setup background services (billing worker)
fn setup_background_services(
    storage: Arc<dyn Storage>,
    ledger: Ledger,
    config: &Config,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    // Track all background task handles for graceful shutdown
    let mut background_tasks = Vec::new();

    let worker = Arc::new(Worker::new(storage, ledger, config.worker.clone()));
    let worker_shutdown = shutdown_token.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = worker.run(worker_shutdown).await {
            tracing::error!(error = %e, "Billing worker exited with error");
        }
    });
    background_tasks.push(handle);

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Build the storage adapter named by the configuration.
async fn setup_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    match &config.storage {
        StorageConfig::Memory => {
            tracing::info!("Using in-process memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageConfig::Postgres {
            url,
            max_connections,
        } => {
            tracing::info!(max_connections, "Connecting to postgres storage");
            let store = PostgresStore::connect(url, *max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}

/// The assembled pipeline: storage, ledger, and the background worker.
pub struct Application {
    config: Config,
    storage: Arc<dyn Storage>,
    ledger: Ledger,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!("Starting billing pipeline with configuration: {:#?}", config);

        let storage = setup_storage(&config).await?;
        let predictor = create_predictor(config.predictor.clone());

        let ledger = Ledger::builder()
            .storage(storage.clone())
            .predictor(predictor)
            .dispatcher(Arc::new(StoreDispatcher::new(storage.clone())))
            .settle_attempts(config.billing.settle_attempts)
            .build();

        // Create a shutdown token for coordinating graceful shutdown of background tasks
        let shutdown_token = tokio_util::sync::CancellationToken::new();

        let bg_services =
            setup_background_services(storage.clone(), ledger.clone(), &config, shutdown_token);

        Ok(Self {
            config,
            storage,
            ledger,
            bg_services,
        })
    }

    /// The ledger, for submitting and inspecting predictions.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The storage adapter the pipeline runs against.
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Run the pipeline until `shutdown` resolves, then drain the worker.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::info!(
            worker_concurrency = self.config.worker.max_concurrency,
            "Billing pipeline running"
        );

        shutdown.await;

        // Shutdown background services and wait for tasks to complete
        self.bg_services.shutdown().await;

        tracing::info!("Billing pipeline stopped");
        Ok(())
    }
}
