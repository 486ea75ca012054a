//! Validator-to-miner wire messages.
//!
//! The payload type is built from a [`Task`] but has no field for the expected
//! answer, so ground truth cannot leak to a miner.

use crate::task::Task;
use crate::tier::{Tier, TierId};
use serde::{Deserialize, Serialize};

/// Body of a compression request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionPayload {
    pub context: String,
    pub tier: TierId,
    pub max_compressed_tokens: usize,
    pub deadline_ms: u64,
}

impl CompressionPayload {
    pub fn for_task(task: &Task, tier: &Tier) -> Self {
        Self {
            context: task.context.clone(),
            tier: tier.id.clone(),
            max_compressed_tokens: tier.max_compressed_tokens,
            deadline_ms: tier.latency_budget_ms,
        }
    }
}

/// Body of a miner's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionResponse {
    pub compressed_tokens: Vec<Vec<f32>>,
}

/// Reply to a metadata query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MinerMetadata {
    #[serde(default)]
    pub tier: Option<TierId>,
}
