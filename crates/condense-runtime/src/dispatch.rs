//! Compression dispatch.
//!
//! Sends one task to one miner, exactly once, under the tier's latency budget.
//! The deadline is a hard cancellation point: when it fires the in-flight
//! transport future is dropped and any late reply is discarded with it.

use crate::metrics::ValidatorMetrics;
use async_trait::async_trait;
use condense_core::{
    CompressedArtifact, CompressionPayload, CompressionRequest, CompressionResponse, MinerInfo,
    MinerMetadata, OutcomeKind, RejectReason, RequestState, Task, Tier,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection to miner failed: {0}")]
    Connect(String),

    #[error("miner returned status {0}")]
    Status(u16),

    #[error("malformed miner response: {0}")]
    Decode(String),

    #[error("miner response too large ({0} bytes)")]
    TooLarge(usize),
}

/// How the validator reaches miners.
#[async_trait]
pub trait MinerTransport: Send + Sync {
    async fn send_compression_request(
        &self,
        miner: &MinerInfo,
        payload: &CompressionPayload,
    ) -> Result<CompressionResponse, TransportError>;

    async fn fetch_metadata(&self, miner: &MinerInfo) -> Result<MinerMetadata, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Fulfilled {
        artifact: CompressedArtifact,
        response_time: Duration,
    },
    TimedOut,
    Rejected(RejectReason),
}

impl DispatchOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            DispatchOutcome::Fulfilled { .. } => OutcomeKind::Fulfilled,
            DispatchOutcome::TimedOut => OutcomeKind::TimedOut,
            DispatchOutcome::Rejected(_) => OutcomeKind::Rejected,
        }
    }

    fn request_state(&self) -> RequestState {
        match self {
            DispatchOutcome::Fulfilled { .. } => RequestState::Fulfilled,
            DispatchOutcome::TimedOut => RequestState::TimedOut,
            DispatchOutcome::Rejected(_) => RequestState::Rejected,
        }
    }
}

/// A resolved request and its outcome.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub request: CompressionRequest,
    pub outcome: DispatchOutcome,
}

pub struct Dispatcher {
    transport: Arc<dyn MinerTransport>,
    metrics: Option<ValidatorMetrics>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn MinerTransport>) -> Self {
        Self {
            transport,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ValidatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transport(&self) -> &Arc<dyn MinerTransport> {
        &self.transport
    }

    pub async fn dispatch(&self, task: &Task, tier: &Tier, miner: &MinerInfo) -> Dispatched {
        let budget = tier.latency_budget();
        let mut request = CompressionRequest::new(task, miner.id.clone(), budget);
        let payload = CompressionPayload::for_task(task, tier);

        let started = Instant::now();
        let reply = tokio::time::timeout(
            budget,
            self.transport.send_compression_request(miner, &payload),
        )
        .await;
        let response_time = started.elapsed();

        let outcome = match reply {
            Err(_) => DispatchOutcome::TimedOut,
            Ok(Err(e)) => DispatchOutcome::Rejected(RejectReason::Transport {
                message: e.to_string(),
            }),
            Ok(Ok(response)) => {
                let artifact =
                    CompressedArtifact::new(miner.id.clone(), request.id, response.compressed_tokens);
                match artifact.validate(tier) {
                    Ok(()) => DispatchOutcome::Fulfilled {
                        artifact,
                        response_time,
                    },
                    Err(v) => DispatchOutcome::Rejected(RejectReason::InvalidArtifact(v)),
                }
            }
        };

        if let Err(e) = request.resolve(outcome.request_state()) {
            warn!("Request {} resolved twice: {}", request.id, e);
        }

        match &outcome {
            DispatchOutcome::Fulfilled { artifact, .. } => debug!(
                miner = %miner.id,
                tier = %tier.id,
                task = task.id.short(),
                soft_tokens = artifact.len(),
                "Artifact received in {:?}",
                response_time
            ),
            DispatchOutcome::TimedOut => debug!(
                miner = %miner.id,
                tier = %tier.id,
                task = task.id.short(),
                "No response within {:?}",
                budget
            ),
            DispatchOutcome::Rejected(reason) => debug!(
                miner = %miner.id,
                tier = %tier.id,
                task = task.id.short(),
                "Rejected: {}",
                reason
            ),
        }

        if let Some(metrics) = &self.metrics {
            let secs = matches!(outcome, DispatchOutcome::Fulfilled { .. })
                .then(|| response_time.as_secs_f64());
            metrics.record_dispatch(tier.id.as_str(), outcome.kind().as_str(), secs);
        }

        Dispatched { request, outcome }
    }
}
