//! Service tiers and the tier table.
//!
//! A tier is a named service class: bounded input context, bounded compressed
//! output, a backing reference model and a latency budget. The table is
//! validated as a whole so that a reload either installs every tier or none.

use crate::miner::{MinerId, MinerInfo};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Tier identifier, e.g. `inference_0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(pub String);

impl TierId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TierId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors raised by tier lookup and tier table validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TierError {
    #[error("unknown tier: {0}")]
    UnknownTier(TierId),

    #[error("tier table is empty")]
    EmptyTable,

    #[error("duplicate tier id: {0}")]
    DuplicateTier(TierId),

    #[error("invalid tier {tier}: {reason}")]
    Invalid { tier: TierId, reason: String },
}

/// Which miners may serve a tier.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Eligibility {
    /// Every miner on the roster
    #[default]
    Any,
    /// Miners whose metadata declares this tier
    DeclaredTier,
    /// An explicit set of miner keys
    AllowList { miners: Vec<MinerId> },
}

impl Eligibility {
    pub fn admits(&self, tier: &TierId, miner: &MinerInfo) -> bool {
        match self {
            Eligibility::Any => true,
            Eligibility::DeclaredTier => miner.declared_tier.as_ref() == Some(tier),
            Eligibility::AllowList { miners } => miners.contains(&miner.id),
        }
    }
}

fn default_importance() -> f64 {
    1.0
}

/// A service class miners compete in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub id: TierId,
    /// Minimum input context length in tokens
    pub min_context_tokens: usize,
    /// Maximum input context length in tokens
    pub max_context_tokens: usize,
    /// Optional bound on the context length in characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_chars: Option<usize>,
    /// Maximum number of soft tokens in a compressed artifact
    pub max_compressed_tokens: usize,
    /// Expected soft-token width; artifacts of another width are rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<usize>,
    /// Reference model the artifact is evaluated against
    pub model: String,
    /// Response latency budget in milliseconds
    pub latency_budget_ms: u64,
    /// Weight of this tier in a miner's combined score
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub eligibility: Eligibility,
}

impl Tier {
    pub fn new(
        id: impl Into<TierId>,
        context_tokens: (usize, usize),
        max_compressed_tokens: usize,
        model: impl Into<String>,
        latency_budget: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            min_context_tokens: context_tokens.0,
            max_context_tokens: context_tokens.1,
            max_context_chars: None,
            max_compressed_tokens,
            hidden_size: None,
            model: model.into(),
            latency_budget_ms: latency_budget.as_millis() as u64,
            importance: default_importance(),
            eligibility: Eligibility::Any,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = Some(hidden_size);
        self
    }

    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = Some(chars);
        self
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    /// True if `tokens` (and optionally `chars`) fit this tier's context bounds.
    pub fn accepts_context(&self, tokens: usize, chars: usize) -> bool {
        let chars_ok = self.max_context_chars.map_or(true, |max| chars <= max);
        tokens >= self.min_context_tokens && tokens <= self.max_context_tokens && chars_ok
    }

    pub fn is_eligible(&self, miner: &MinerInfo) -> bool {
        self.eligibility.admits(&self.id, miner)
    }

    pub fn validate(&self) -> Result<(), TierError> {
        let invalid = |reason: &str| TierError::Invalid {
            tier: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.as_str().is_empty() {
            return Err(invalid("empty id"));
        }
        if self.min_context_tokens == 0 {
            return Err(invalid("min_context_tokens must be positive"));
        }
        if self.min_context_tokens > self.max_context_tokens {
            return Err(invalid("min_context_tokens exceeds max_context_tokens"));
        }
        if self.max_compressed_tokens == 0 {
            return Err(invalid("max_compressed_tokens must be positive"));
        }
        if self.max_compressed_tokens >= self.max_context_tokens {
            return Err(invalid(
                "max_compressed_tokens must be smaller than max_context_tokens",
            ));
        }
        if self.hidden_size == Some(0) {
            return Err(invalid("hidden_size must be positive"));
        }
        if self.latency_budget_ms == 0 {
            return Err(invalid("latency budget must be positive"));
        }
        if !self.importance.is_finite() || self.importance < 0.0 {
            return Err(invalid("importance must be a finite non-negative number"));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("model must not be empty"));
        }
        Ok(())
    }
}

/// Immutable, validated set of tiers in configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    tiers: IndexMap<TierId, Tier>,
}

impl TierTable {
    pub fn new(tiers: Vec<Tier>) -> Result<Self, TierError> {
        if tiers.is_empty() {
            return Err(TierError::EmptyTable);
        }
        let mut map = IndexMap::with_capacity(tiers.len());
        for tier in tiers {
            tier.validate()?;
            if map.contains_key(&tier.id) {
                return Err(TierError::DuplicateTier(tier.id));
            }
            map.insert(tier.id.clone(), tier);
        }
        Ok(Self { tiers: map })
    }

    pub fn get(&self, id: &TierId) -> Result<&Tier, TierError> {
        self.tiers
            .get(id)
            .ok_or_else(|| TierError::UnknownTier(id.clone()))
    }

    pub fn contains(&self, id: &TierId) -> bool {
        self.tiers.contains_key(id)
    }

    /// Importance of a tier, or 0 for a tier no longer in the table.
    pub fn importance(&self, id: &TierId) -> f64 {
        self.tiers.get(id).map_or(0.0, |t| t.importance)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TierId> {
        self.tiers.keys()
    }

    pub fn eligible_for<'a>(&'a self, miner: &'a MinerInfo) -> impl Iterator<Item = &'a Tier> {
        self.tiers.values().filter(move |t| t.is_eligible(miner))
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
