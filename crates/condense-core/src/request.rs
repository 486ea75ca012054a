//! Compression requests and their one-shot lifecycle.

use crate::artifact::ArtifactViolation;
use crate::miner::MinerId;
use crate::task::{Task, TaskId};
use crate::tier::TierId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request lifecycle. `Pending` moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Fulfilled,
    Rejected,
    TimedOut,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Pending => write!(f, "pending"),
            RequestState::Fulfilled => write!(f, "fulfilled"),
            RequestState::Rejected => write!(f, "rejected"),
            RequestState::TimedOut => write!(f, "timed_out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request {id} already resolved as {state}")]
    AlreadyResolved { id: RequestId, state: RequestState },

    #[error("request {0} cannot be resolved back to pending")]
    NotTerminal(RequestId),
}

/// Why a miner's response was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("invalid artifact: {0}")]
    InvalidArtifact(ArtifactViolation),

    #[error("transport error: {message}")]
    Transport { message: String },
}

/// A single compression request to one miner for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRequest {
    pub id: RequestId,
    pub task: TaskId,
    pub tier: TierId,
    pub miner: MinerId,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    state: RequestState,
}

impl CompressionRequest {
    pub fn new(task: &Task, miner: MinerId, budget: Duration) -> Self {
        let issued_at = Utc::now();
        let budget = chrono::Duration::from_std(budget).unwrap_or(chrono::Duration::zero());
        Self {
            id: RequestId::new(),
            task: task.id.clone(),
            tier: task.tier.clone(),
            miner,
            issued_at,
            deadline: issued_at + budget,
            state: RequestState::Pending,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn resolve(&mut self, next: RequestState) -> Result<(), RequestError> {
        if self.state.is_terminal() {
            return Err(RequestError::AlreadyResolved {
                id: self.id,
                state: self.state,
            });
        }
        if !next.is_terminal() {
            return Err(RequestError::NotTerminal(self.id));
        }
        self.state = next;
        Ok(())
    }
}
