//! # Condense Core
//!
//! Data model for the Condense context-compression benchmark.
//!
//! Miners compress long contexts into short sequences of soft tokens; a
//! validator generates tasks, dispatches them, scores what comes back and
//! turns the scores into incentive weights. This crate holds the types those
//! stages pass between each other and the pure scoring helpers:
//!
//! - [`tier`]: service tiers and the validated tier table
//! - [`task`]: tasks, probes and ground truth
//! - [`request`]: compression requests and their one-shot lifecycle
//! - [`artifact`]: miner artifacts and shape validation
//! - [`score`]: score records, latency score and normalized weights
//! - [`protocol`]: wire messages exchanged with miners
//! - [`text`]: tokenizer and answer comparison helpers

pub mod artifact;
pub mod miner;
pub mod protocol;
pub mod request;
pub mod score;
pub mod task;
pub mod text;
pub mod tier;

pub use artifact::{ArtifactViolation, CompressedArtifact, SoftToken};
pub use miner::{MinerId, MinerInfo};
pub use protocol::{CompressionPayload, CompressionResponse, MinerMetadata};
pub use request::{CompressionRequest, RejectReason, RequestError, RequestId, RequestState};
pub use score::{
    latency_score, IncentiveWeight, OutcomeKind, ScoreRecord, Weights, WEIGHT_SUM_EPSILON,
};
pub use task::{ExpectedAnswer, Probe, ProbeKind, Task, TaskId};
pub use text::{Tokenizer, WhitespaceTokenizer};
pub use tier::{Eligibility, Tier, TierError, TierId, TierTable};
