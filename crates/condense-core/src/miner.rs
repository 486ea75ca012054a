//! Miner identity and roster entries.

use crate::tier::TierId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque miner key (a hotkey on the host ledger).
///
/// Dispatch and scoring only ever refer to miners through this key, so no
/// miner-owned state is shared between the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinerId(pub String);

impl MinerId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MinerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A miner the validator knows how to reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerInfo {
    pub id: MinerId,
    /// Base URL of the miner's compression endpoint
    pub endpoint: String,
    /// Tier the miner reported through its metadata query, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_tier: Option<TierId>,
}

impl MinerInfo {
    pub fn new(id: impl Into<MinerId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            declared_tier: None,
        }
    }

    pub fn with_declared_tier(mut self, tier: impl Into<TierId>) -> Self {
        self.declared_tier = Some(tier.into());
        self
    }
}
