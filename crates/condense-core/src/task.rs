//! Synthetic benchmark tasks.

use crate::tier::TierId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Kind of question asked about a context. Each kind has its own scoring rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    FactLookup,
    VerbatimRecall,
    Continuation,
    SummaryCheckpoint,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 4] = [
        ProbeKind::FactLookup,
        ProbeKind::VerbatimRecall,
        ProbeKind::Continuation,
        ProbeKind::SummaryCheckpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::FactLookup => "fact_lookup",
            ProbeKind::VerbatimRecall => "verbatim_recall",
            ProbeKind::Continuation => "continuation",
            ProbeKind::SummaryCheckpoint => "summary_checkpoint",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProbeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown probe kind: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub kind: ProbeKind,
    pub prompt: String,
}

impl Probe {
    pub fn new(kind: ProbeKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
        }
    }
}

/// Ground truth for a probe. Never leaves the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExpectedAnswer {
    Text(String),
    Keywords(Vec<String>),
}

impl ExpectedAnswer {
    pub fn as_text(&self) -> String {
        match self {
            ExpectedAnswer::Text(t) => t.clone(),
            ExpectedAnswer::Keywords(k) => k.join(", "),
        }
    }
}

/// Content fingerprint of a task (hex SHA-256 over tier, context and probe).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn fingerprint(tier: &TierId, context: &str, probe: &Probe) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tier.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(context.as_bytes());
        hasher.update([0u8]);
        hasher.update(probe.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(probe.prompt.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A context plus a probe about it, issued to every eligible miner of a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tier: TierId,
    pub context: String,
    /// Context length under the validator tokenizer
    pub context_tokens: usize,
    pub probe: Probe,
    pub expected: ExpectedAnswer,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        tier: TierId,
        context: String,
        context_tokens: usize,
        probe: Probe,
        expected: ExpectedAnswer,
        seed: u64,
    ) -> Self {
        let id = TaskId::fingerprint(&tier, &context, &probe);
        Self {
            id,
            tier,
            context,
            context_tokens,
            probe,
            expected,
            seed,
            created_at: Utc::now(),
        }
    }
}
