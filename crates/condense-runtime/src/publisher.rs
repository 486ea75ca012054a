//! Incentive publishing
//!
//! The publisher checks that a weight vector sums to 1, fixes it when it
//! drifts, and hands it to a consensus sink. A failed submission is reported
//! and logged; it never rolls back scoring state.

use crate::metrics::ValidatorMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use condense_core::{IncentiveWeight, MinerId, Weights, WEIGHT_SUM_EPSILON};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("nothing to publish")]
    Empty,

    #[error("sink '{sink}' rejected weights: {message}")]
    Rejected { sink: String, message: String },

    #[error("sink '{sink}' unreachable: {message}")]
    Unreachable { sink: String, message: String },

    #[error("sink I/O error: {0}")]
    Io(String),
}

/// Weight vector as submitted to a consensus sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSubmission {
    pub round: u64,
    pub submitted_at: DateTime<Utc>,
    pub weights: Vec<IncentiveWeight>,
    /// Same weights as integer shares of `u16::MAX`
    pub quantized: Vec<QuantizedWeight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedWeight {
    pub miner: MinerId,
    pub share: u16,
}

impl WeightSubmission {
    pub fn new(round: u64, weights: &Weights) -> Self {
        Self {
            round,
            submitted_at: Utc::now(),
            weights: weights.to_vec(),
            quantized: weights
                .quantize_u16()
                .into_iter()
                .map(|(miner, share)| QuantizedWeight { miner, share })
                .collect(),
        }
    }
}

/// Where weights end up
#[async_trait]
pub trait WeightSink: Send + Sync {
    fn name(&self) -> &str;

    async fn submit_weights(&self, round: u64, weights: &Weights) -> Result<(), PublishError>;
}

/// Logs each submission at info level
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl WeightSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_weights(&self, round: u64, weights: &Weights) -> Result<(), PublishError> {
        for (miner, w) in weights.iter() {
            info!(round, miner = %miner, "weight {:.6}", w);
        }
        Ok(())
    }
}

/// Appends one JSON line per submission
pub struct JsonlFileSink {
    name: String,
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl JsonlFileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, PublishError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PublishError::Io(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PublishError::Io(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WeightSink for JsonlFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_weights(&self, round: u64, weights: &Weights) -> Result<(), PublishError> {
        let json = serde_json::to_string(&WeightSubmission::new(round, weights))
            .map_err(|e| PublishError::Io(e.to_string()))?;
        let mut file = self.file.lock().await;
        writeln!(file, "{}", json).map_err(|e| PublishError::Io(e.to_string()))?;
        file.flush().map_err(|e| PublishError::Io(e.to_string()))?;
        Ok(())
    }
}

/// What was handed to the sink
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub round: u64,
    pub weights: Weights,
    /// The input had to be renormalized first
    pub renormalized: bool,
}

pub struct IncentivePublisher {
    sink: Arc<dyn WeightSink>,
    metrics: Option<ValidatorMetrics>,
}

impl IncentivePublisher {
    pub fn new(sink: Arc<dyn WeightSink>) -> Self {
        Self {
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ValidatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    pub async fn publish(
        &self,
        round: u64,
        weights: &Weights,
    ) -> Result<PublishReceipt, PublishError> {
        let (weights, renormalized) = if weights.is_normalized() {
            (weights.clone(), false)
        } else {
            warn!(
                round,
                "Weights sum to {:.9}, renormalizing before publish",
                weights.sum()
            );
            match weights.renormalized() {
                Some(w) => (w, true),
                None => {
                    self.record_failure();
                    return Err(PublishError::Empty);
                }
            }
        };
        debug_assert!((weights.sum() - 1.0).abs() <= WEIGHT_SUM_EPSILON);

        match self.sink.submit_weights(round, &weights).await {
            Ok(()) => {
                info!(
                    round,
                    sink = self.sink.name(),
                    miners = weights.len(),
                    "Published weights"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.set_weights(weights.iter().map(|(m, w)| (m.as_str(), w)));
                }
                Ok(PublishReceipt {
                    round,
                    weights,
                    renormalized,
                })
            }
            Err(e) => {
                error!(round, sink = self.sink.name(), "Publish failed: {}", e);
                self.record_failure();
                Err(e)
            }
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.publish_failures.inc();
        }
    }
}
