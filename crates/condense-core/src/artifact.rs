//! Compressed artifacts returned by miners and their shape checks.

use crate::miner::MinerId;
use crate::request::RequestId;
use crate::tier::Tier;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One continuous embedding consumed directly by the reference model.
pub type SoftToken = Vec<f32>;

/// Why an artifact was refused before evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum ArtifactViolation {
    #[error("artifact is empty")]
    Empty,

    #[error("artifact has {len} soft tokens, tier allows at most {max}")]
    TooLong { len: usize, max: usize },

    #[error("soft token {index} has width {width}, expected {expected}")]
    Shape {
        index: usize,
        width: usize,
        expected: usize,
    },

    #[error("soft token {index} contains a non-finite value")]
    NonFinite { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedArtifact {
    pub miner: MinerId,
    pub request_id: RequestId,
    pub tokens: Vec<SoftToken>,
}

impl CompressedArtifact {
    pub fn new(miner: MinerId, request_id: RequestId, tokens: Vec<SoftToken>) -> Self {
        Self {
            miner,
            request_id,
            tokens,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Width of the first soft token.
    pub fn hidden_size(&self) -> Option<usize> {
        self.tokens.first().map(Vec::len)
    }

    /// Check length and shape against the tier. Over-long artifacts are
    /// refused outright, never truncated.
    pub fn validate(&self, tier: &Tier) -> Result<(), ArtifactViolation> {
        if self.tokens.is_empty() {
            return Err(ArtifactViolation::Empty);
        }
        if self.tokens.len() > tier.max_compressed_tokens {
            return Err(ArtifactViolation::TooLong {
                len: self.tokens.len(),
                max: tier.max_compressed_tokens,
            });
        }

        let expected = match tier.hidden_size {
            Some(size) => size,
            None => self.tokens[0].len(),
        };
        for (index, token) in self.tokens.iter().enumerate() {
            if token.len() != expected || token.is_empty() {
                return Err(ArtifactViolation::Shape {
                    index,
                    width: token.len(),
                    expected,
                });
            }
            if token.iter().any(|v| !v.is_finite()) {
                return Err(ArtifactViolation::NonFinite { index });
            }
        }
        Ok(())
    }
}
