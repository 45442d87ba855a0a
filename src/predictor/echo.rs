//! Echo predictor for development and tests.

use async_trait::async_trait;
use std::time::Duration;

use super::{Completion, Predictor, Result};

/// Parrots the input back as `"Echo: {input}"` after an optional artificial
/// delay, counting whitespace-separated words as tokens. Useful for
/// exercising the pipeline without a real inference backend.
#[derive(Debug, Clone, Default)]
pub struct EchoPredictor {
    delay: Duration,
}

impl EchoPredictor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

fn token_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

#[async_trait]
impl Predictor for EchoPredictor {
    async fn complete(&self, input: &str) -> Result<Completion> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let output_text = format!("Echo: {input}");
        Ok(Completion {
            input_tokens: token_count(input),
            output_tokens: token_count(&output_text),
            output_text,
        })
    }
}
