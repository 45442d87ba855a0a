//! Prediction backend abstraction layer
//!
//! This module defines the `Predictor` trait which abstracts the text
//! completion backend the pipeline bills for. The backend is assumed
//! neither exactly-once nor low-latency; callers own idempotence and
//! lease-keeping around the call.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PredictorConfig;

pub mod echo;

/// Create a predictor from configuration
///
/// The single point where config becomes a backend instance. Adding a new
/// backend requires adding a match arm here.
pub fn create_predictor(config: PredictorConfig) -> Arc<dyn Predictor> {
    match config {
        PredictorConfig::Echo { delay } => Arc::new(echo::EchoPredictor::new(delay)),
    }
}

/// Result type for predictor operations
pub type Result<T> = std::result::Result<T, PredictorError>;

/// Faults a prediction backend can raise
#[derive(Debug, thiserror::Error)]
pub enum PredictorError {
    #[error("predictor timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered but the response is unusable. Redelivery will
    /// not help.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl PredictorError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, PredictorError::Malformed(_))
    }
}

/// A finished completion with the token counts billing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub output_text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Abstract text-completion backend
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Run one completion. May take arbitrarily long; callers keep their
    /// job lease alive for the duration.
    async fn complete(&self, input: &str) -> Result<Completion>;
}
