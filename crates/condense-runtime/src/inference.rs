//! Reference-model interface.
//!
//! The validator never runs a model itself; it asks an engine to either
//! generate text or score a target continuation, feeding it raw text or a
//! compressed soft-token prefix.

use async_trait::async_trait;
use condense_core::SoftToken;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelInput {
    /// Plain text prompt
    Text { text: String },
    /// Soft tokens standing in for the context, followed by a text prompt
    Compressed {
        soft_tokens: Vec<SoftToken>,
        prompt: String,
    },
}

impl ModelInput {
    pub fn text(text: impl Into<String>) -> Self {
        ModelInput::Text { text: text.into() }
    }

    pub fn compressed(soft_tokens: Vec<SoftToken>, prompt: impl Into<String>) -> Self {
        ModelInput::Compressed {
            soft_tokens,
            prompt: prompt.into(),
        }
    }
}

/// Decoding parameters. Evaluation always decodes greedily with a fixed seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub seed: u64,
}

impl GenerationParams {
    pub fn greedy(max_new_tokens: usize, seed: u64) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(String),

    #[error("inference engine returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed inference response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Generate an answer from `input`.
    async fn generate(
        &self,
        model: &str,
        input: &ModelInput,
        params: &GenerationParams,
    ) -> Result<String, InferenceError>;

    /// Per-token log-probabilities of `target` following `input`.
    async fn log_likelihood(
        &self,
        model: &str,
        input: &ModelInput,
        target: &str,
    ) -> Result<Vec<f64>, InferenceError>;
}
