//! Validator rounds
//!
//! A round takes one tier-table snapshot and then:
//!
//! 1. generates a task per tier (a tier that cannot produce one is skipped)
//! 2. dispatches each task to every eligible miner, concurrently and bounded
//! 3. scores each outcome; fulfilled artifacts go through the evaluation pool
//! 4. appends the scores, aggregates, commits and publishes the weights
//! 5. persists the new state
//!
//! One miner's failure only affects that miner's score.

use crate::aggregation::{AggregationConfig, ScoreAggregator};
use crate::dispatch::{DispatchOutcome, Dispatcher, MinerTransport};
use crate::eval_pool::{EvaluationJob, EvaluationPool, EvaluationPoolConfig};
use crate::fidelity::{EvaluationError, EvaluatorConfig, FidelityEvaluator};
use crate::generator::{GeneratorConfig, TaskGenerator};
use crate::inference::InferenceEngine;
use crate::metrics::ValidatorMetrics;
use crate::persistence::{StoreError, ValidatorSnapshot, WeightStore};
use crate::publisher::{IncentivePublisher, WeightSink};
use crate::registry::{RegistryError, TierRegistry};
use chrono::Utc;
use condense_core::{MinerId, MinerInfo, OutcomeKind, ScoreRecord, Task, Tier, TierId, Weights};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Tasks generated per tier per round
    pub tasks_per_tier: usize,
    /// Concurrent dispatches; miners × tiers when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_concurrency: Option<usize>,
    pub metadata_timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tasks_per_tier: 1,
            dispatch_concurrency: None,
            metadata_timeout_ms: 2_000,
        }
    }
}

/// Summary of one round
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round: u64,
    pub tasks: usize,
    pub dispatched: usize,
    pub fulfilled: usize,
    pub timed_out: usize,
    pub rejected: usize,
    /// Outcomes dropped because the reference model failed
    pub evaluation_failures: usize,
    pub skipped_tiers: Vec<TierId>,
    pub scores: Vec<ScoreRecord>,
    /// Weights committed this round, if any
    pub weights: Option<Weights>,
    pub published: bool,
    pub duration: Duration,
}

pub struct ValidatorBuilder {
    config: ValidatorConfig,
    registry: Arc<TierRegistry>,
    transport: Arc<dyn MinerTransport>,
    engine: Arc<dyn InferenceEngine>,
    sink: Arc<dyn WeightSink>,
    generator: Option<TaskGenerator>,
    evaluator: EvaluatorConfig,
    pool: EvaluationPoolConfig,
    aggregation: AggregationConfig,
    store: Option<Arc<dyn WeightStore>>,
    metrics: Option<ValidatorMetrics>,
}

impl ValidatorBuilder {
    pub fn config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn generator(mut self, generator: TaskGenerator) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn evaluator(mut self, config: EvaluatorConfig) -> Self {
        self.evaluator = config;
        self
    }

    pub fn pool(mut self, config: EvaluationPoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn aggregation(mut self, config: AggregationConfig) -> Self {
        self.aggregation = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn WeightStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: ValidatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Must run inside a tokio runtime; the evaluation pool starts here.
    pub fn build(self) -> Validator {
        let mut dispatcher = Dispatcher::new(self.transport);
        let mut evaluator = FidelityEvaluator::new(self.engine, self.evaluator);
        let mut publisher = IncentivePublisher::new(self.sink);
        if let Some(metrics) = &self.metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
            evaluator = evaluator.with_metrics(metrics.clone());
            publisher = publisher.with_metrics(metrics.clone());
        }
        let evaluator = Arc::new(evaluator);
        let mut pool = EvaluationPool::new(self.pool, evaluator.clone());
        if let Some(metrics) = &self.metrics {
            pool = pool.with_metrics(metrics.clone());
        }

        Validator {
            config: self.config,
            registry: self.registry,
            generator: self
                .generator
                .unwrap_or_else(|| TaskGenerator::synthetic(GeneratorConfig::default())),
            dispatcher: Arc::new(dispatcher),
            evaluator,
            pool: Arc::new(pool),
            aggregator: ScoreAggregator::new(self.aggregation),
            publisher,
            store: self.store,
            metrics: self.metrics,
            round: 0,
        }
    }
}

pub struct Validator {
    config: ValidatorConfig,
    registry: Arc<TierRegistry>,
    generator: TaskGenerator,
    dispatcher: Arc<Dispatcher>,
    evaluator: Arc<FidelityEvaluator>,
    pool: Arc<EvaluationPool>,
    aggregator: ScoreAggregator,
    publisher: IncentivePublisher,
    store: Option<Arc<dyn WeightStore>>,
    metrics: Option<ValidatorMetrics>,
    round: u64,
}

type Scored = (OutcomeKind, Result<ScoreRecord, EvaluationError>);

impl Validator {
    pub fn builder(
        registry: Arc<TierRegistry>,
        transport: Arc<dyn MinerTransport>,
        engine: Arc<dyn InferenceEngine>,
        sink: Arc<dyn WeightSink>,
    ) -> ValidatorBuilder {
        ValidatorBuilder {
            config: ValidatorConfig::default(),
            registry,
            transport,
            engine,
            sink,
            generator: None,
            evaluator: EvaluatorConfig::default(),
            pool: EvaluationPoolConfig::default(),
            aggregation: AggregationConfig::default(),
            store: None,
            metrics: None,
        }
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &ScoreAggregator {
        &self.aggregator
    }

    pub fn pool(&self) -> &Arc<EvaluationPool> {
        &self.pool
    }

    /// Last completed round number.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Resume from the store's snapshot. Returns whether one was found.
    pub fn restore(&mut self) -> Result<bool, StoreError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match store.load_snapshot()? {
            Some(snapshot) => {
                info!(
                    round = snapshot.round,
                    miners = snapshot.weights.len(),
                    records = snapshot.scores.len(),
                    "Restored validator state"
                );
                self.round = snapshot.round;
                self.aggregator.restore_windows(snapshot.scores, Utc::now());
                self.aggregator.commit(snapshot.weights);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ask each miner for its declared tier. A reply without a tier clears the
    /// declaration; miners that do not answer keep whatever was declared before.
    pub async fn refresh_metadata(&self, roster: &mut [MinerInfo]) {
        let timeout = Duration::from_millis(self.config.metadata_timeout_ms);
        let mut set = JoinSet::new();
        for (i, miner) in roster.iter().enumerate() {
            let transport = self.dispatcher.transport().clone();
            let miner = miner.clone();
            set.spawn(async move {
                let reply = tokio::time::timeout(timeout, transport.fetch_metadata(&miner)).await;
                (i, miner.id, reply)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, _, Ok(Ok(meta)))) => roster[i].declared_tier = meta.tier,
                Ok((_, id, Ok(Err(e)))) => debug!(miner = %id, "Metadata query failed: {}", e),
                Ok((_, id, Err(_))) => debug!(miner = %id, "Metadata query timed out"),
                Err(e) => error!("Metadata task failed: {}", e),
            }
        }
    }

    pub async fn run_round(&mut self, roster: &[MinerInfo]) -> Result<RoundReport, ValidatorError> {
        let started = Instant::now();
        let tiers = self.registry.snapshot()?;
        let round = self.round + 1;

        let mut skipped_tiers = Vec::new();
        let mut plans: Vec<(Arc<Task>, Tier, Vec<MinerInfo>)> = Vec::new();
        for tier in tiers.iter() {
            let eligible: Vec<MinerInfo> = roster
                .iter()
                .filter(|m| tier.is_eligible(m))
                .cloned()
                .collect();
            if eligible.is_empty() {
                debug!(round, tier = %tier.id, "No eligible miners");
                continue;
            }
            for _ in 0..self.config.tasks_per_tier.max(1) {
                match self.generator.generate(tier) {
                    Ok(task) => plans.push((Arc::new(task), tier.clone(), eligible.clone())),
                    Err(e) => {
                        warn!(round, tier = %tier.id, "Skipping tier: {}", e);
                        if let Some(metrics) = &self.metrics {
                            metrics.record_skipped_tier(tier.id.as_str());
                        }
                        skipped_tiers.push(tier.id.clone());
                        break;
                    }
                }
            }
        }

        let limit = self
            .config
            .dispatch_concurrency
            .unwrap_or(roster.len() * tiers.len())
            .max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let mut set: JoinSet<Scored> = JoinSet::new();
        for (task, tier, miners) in &plans {
            for miner in miners {
                set.spawn(Self::score_one(
                    self.dispatcher.clone(),
                    self.evaluator.clone(),
                    self.pool.clone(),
                    permits.clone(),
                    task.clone(),
                    tier.clone(),
                    miner.clone(),
                ));
            }
        }

        let mut report = RoundReport {
            round,
            tasks: plans.len(),
            dispatched: set.len(),
            fulfilled: 0,
            timed_out: 0,
            rejected: 0,
            evaluation_failures: 0,
            skipped_tiers,
            scores: Vec::new(),
            weights: None,
            published: false,
            duration: Duration::ZERO,
        };

        while let Some(joined) = set.join_next().await {
            let (kind, result) = match joined {
                Ok(scored) => scored,
                Err(e) => {
                    error!(round, "Scoring task failed: {}", e);
                    continue;
                }
            };
            match kind {
                OutcomeKind::Fulfilled => report.fulfilled += 1,
                OutcomeKind::TimedOut => report.timed_out += 1,
                OutcomeKind::Rejected => report.rejected += 1,
            }
            match result {
                Ok(record) => report.scores.push(record),
                Err(_) => report.evaluation_failures += 1,
            }
        }

        self.aggregator.append(report.scores.iter().cloned(), Utc::now());
        let roster_ids: Vec<MinerId> = roster.iter().map(|m| m.id.clone()).collect();
        if let Some(weights) = self.aggregator.aggregate(&tiers, &roster_ids) {
            self.aggregator.commit(weights.clone());
            match self.publisher.publish(round, &weights).await {
                Ok(_) => report.published = true,
                Err(e) => warn!(round, "Weights not published: {}", e),
            }
            report.weights = Some(weights);
        } else {
            info!(round, "No scores yet; nothing to publish");
        }

        self.round = round;
        if let (Some(store), Some(weights)) = (&self.store, &report.weights) {
            let snapshot = ValidatorSnapshot::new(
                round,
                weights.clone(),
                self.aggregator.windows().checkpoint(),
            );
            if let Err(e) = store.save_snapshot(&snapshot) {
                error!(round, "Failed to persist validator state: {}", e);
            }
        }

        report.duration = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_round(report.duration.as_secs_f64());
        }
        info!(
            round,
            tasks = report.tasks,
            dispatched = report.dispatched,
            fulfilled = report.fulfilled,
            timed_out = report.timed_out,
            rejected = report.rejected,
            evaluation_failures = report.evaluation_failures,
            "Round complete in {:?}",
            report.duration
        );
        Ok(report)
    }

    async fn score_one(
        dispatcher: Arc<Dispatcher>,
        evaluator: Arc<FidelityEvaluator>,
        pool: Arc<EvaluationPool>,
        permits: Arc<Semaphore>,
        task: Arc<Task>,
        tier: Tier,
        miner: MinerInfo,
    ) -> Scored {
        let permit = permits.acquire_owned().await.ok();
        let dispatched = dispatcher.dispatch(&task, &tier, &miner).await;
        drop(permit);

        let kind = dispatched.outcome.kind();
        let result = match dispatched.outcome {
            outcome @ DispatchOutcome::Fulfilled { .. } => {
                pool.evaluate(EvaluationJob {
                    task,
                    tier,
                    miner: miner.id,
                    outcome,
                })
                .await
            }
            outcome => evaluator.evaluate(&task, &tier, &miner.id, &outcome).await,
        };
        (kind, result)
    }
}
