//! Evaluation pool
//!
//! Reference-model calls are expensive, so artifacts are queued and evaluated
//! with a bounded number of concurrent calls per tier, while dispatch to
//! miners keeps running at full width. The queue only drains while the head
//! job's tier has a free permit; `queue_size` bounds everything behind it.
//!
//! # Example
//! ```ignore
//! let pool = EvaluationPool::new(EvaluationPoolConfig::default(), evaluator);
//! let record = pool.evaluate(job).await?;
//! println!("Metrics: {:?}", pool.metrics().await);
//! ```

use crate::dispatch::DispatchOutcome;
use crate::fidelity::{EvaluationError, FidelityEvaluator};
use crate::metrics::ValidatorMetrics;
use condense_core::{MinerId, ScoreRecord, Task, Tier, TierId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LATENCY_SAMPLES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationPoolConfig {
    /// Pool name for logs
    pub name: String,
    /// Concurrent reference-model evaluations per tier
    pub per_tier_concurrency: usize,
    /// Maximum queued jobs
    pub queue_size: usize,
    pub backpressure: BackpressureStrategy,
}

impl Default for EvaluationPoolConfig {
    fn default() -> Self {
        Self {
            name: "evaluation".to_string(),
            per_tier_concurrency: 1,
            queue_size: 1024,
            backpressure: BackpressureStrategy::Block,
        }
    }
}

/// What `submit` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Wait for space
    Block,
    /// Fail the submission
    Error,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("pool '{pool}' queue full (depth: {depth})")]
    QueueFull { pool: String, depth: usize },

    #[error("pool '{0}' is shut down")]
    Closed(String),
}

impl From<PoolError> for EvaluationError {
    fn from(e: PoolError) -> Self {
        EvaluationError::PoolUnavailable(e.to_string())
    }
}

/// One artifact (or failed dispatch) waiting to be scored
#[derive(Debug, Clone)]
pub struct EvaluationJob {
    pub task: Arc<Task>,
    pub tier: Tier,
    pub miner: MinerId,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationPoolMetrics {
    pub queue_depth: usize,
    /// Evaluations currently holding a tier permit
    pub in_flight: usize,
    pub processed: u64,
    /// Submissions refused by backpressure
    pub rejected: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
}

type Reply = oneshot::Sender<Result<ScoreRecord, EvaluationError>>;

struct Queued {
    job: EvaluationJob,
    reply: Reply,
}

struct Shared {
    evaluator: Arc<FidelityEvaluator>,
    per_tier: usize,
    permits: Mutex<FxHashMap<TierId, Arc<Semaphore>>>,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    latencies: Mutex<Vec<u64>>,
}

impl Shared {
    async fn tier_permits(&self, tier: &TierId) -> Arc<Semaphore> {
        let mut permits = self.permits.lock().await;
        permits
            .entry(tier.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_tier)))
            .clone()
    }
}

pub struct EvaluationPool {
    config: EvaluationPoolConfig,
    queue_tx: mpsc::Sender<Queued>,
    shared: Arc<Shared>,
    rejected: AtomicU64,
    metrics: Option<ValidatorMetrics>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl EvaluationPool {
    pub fn new(config: EvaluationPoolConfig, evaluator: Arc<FidelityEvaluator>) -> Self {
        let queue_size = config.queue_size.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            evaluator,
            per_tier: config.per_tier_concurrency.max(1),
            permits: Mutex::new(FxHashMap::default()),
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            latencies: Mutex::new(Vec::with_capacity(LATENCY_SAMPLES)),
        });

        tokio::spawn(Self::dispatcher_task(
            queue_rx,
            shutdown_rx,
            shared.clone(),
            config.name.clone(),
        ));

        Self {
            config,
            queue_tx,
            shared,
            rejected: AtomicU64::new(0),
            metrics: None,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn with_metrics(mut self, metrics: ValidatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn dispatcher_task(
        mut rx: mpsc::Receiver<Queued>,
        mut shutdown_rx: mpsc::Receiver<()>,
        shared: Arc<Shared>,
        pool_name: String,
    ) {
        info!(
            "Evaluation pool '{}' started ({} per tier)",
            pool_name, shared.per_tier
        );

        loop {
            tokio::select! {
                Some(queued) = rx.recv() => {
                    // Hold the tier permit before taking the next job, so a
                    // saturated tier leaves later jobs in the bounded queue.
                    let permits = shared.tier_permits(&queued.job.tier.id).await;
                    let Ok(permit) = permits.acquire_owned().await else {
                        let _ = queued.reply.send(Err(EvaluationError::PoolUnavailable(
                            "tier semaphore closed".into(),
                        )));
                        continue;
                    };

                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        shared.in_flight.fetch_add(1, Ordering::Relaxed);
                        let start = Instant::now();
                        let job = &queued.job;
                        let result = shared
                            .evaluator
                            .evaluate(&job.task, &job.tier, &job.miner, &job.outcome)
                            .await;
                        let elapsed_ms = start.elapsed().as_millis() as u64;
                        shared.in_flight.fetch_sub(1, Ordering::Relaxed);
                        shared.processed.fetch_add(1, Ordering::Relaxed);

                        {
                            let mut lat = shared.latencies.lock().await;
                            if lat.len() >= LATENCY_SAMPLES {
                                lat.remove(0);
                            }
                            lat.push(elapsed_ms);
                        }

                        if queued.reply.send(result).is_err() {
                            debug!("Evaluation result for {} dropped by caller", job.miner);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Evaluation pool '{}' shutting down", pool_name);
                    break;
                }
                else => break,
            }
        }
    }

    /// Queue a job; the receiver yields the score when evaluation finishes.
    pub async fn submit(
        &self,
        job: EvaluationJob,
    ) -> Result<oneshot::Receiver<Result<ScoreRecord, EvaluationError>>, PoolError> {
        let (reply, rx) = oneshot::channel();
        let queued = Queued { job, reply };

        let sent = match self.config.backpressure {
            BackpressureStrategy::Block => self
                .queue_tx
                .send(queued)
                .await
                .map_err(|_| PoolError::Closed(self.config.name.clone())),
            BackpressureStrategy::Error => match self.queue_tx.try_send(queued) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Pool '{}' queue full", self.config.name);
                    Err(PoolError::QueueFull {
                        pool: self.config.name.clone(),
                        depth: self.queue_depth(),
                    })
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(PoolError::Closed(self.config.name.clone()))
                }
            },
        };

        if let Some(metrics) = &self.metrics {
            metrics.eval_queue_depth.set(self.queue_depth() as f64);
        }
        sent.map(|()| rx)
    }

    /// Submit and wait for the score.
    pub async fn evaluate(&self, job: EvaluationJob) -> Result<ScoreRecord, EvaluationError> {
        let rx = self.submit(job).await?;
        rx.await.map_err(|_| {
            EvaluationError::PoolUnavailable(format!("pool '{}' dropped the job", self.config.name))
        })?
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    pub async fn metrics(&self) -> EvaluationPoolMetrics {
        let latencies = self.shared.latencies.lock().await;
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        let p99_latency = if latencies.is_empty() {
            0.0
        } else {
            let mut sorted = latencies.clone();
            sorted.sort_unstable();
            let idx = (sorted.len() as f64 * 0.99) as usize;
            sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(0) as f64
        };

        EvaluationPoolMetrics {
            queue_depth: self.queue_depth(),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            avg_latency_ms: avg_latency,
            p99_latency_ms: p99_latency,
        }
    }

    pub fn config(&self) -> &EvaluationPoolConfig {
        &self.config
    }

    /// Stop accepting work. Jobs already spawned run to completion.
    pub async fn shutdown(&mut self) -> Duration {
        let start = Instant::now();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        start.elapsed()
    }
}

impl Drop for EvaluationPool {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
