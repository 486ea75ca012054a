//! Fidelity evaluation.
//!
//! Substitutes a miner's artifact for the raw context in the tier's reference
//! model and checks how well the model can still answer the task's probe.
//!
//! | Probe kind | Metric |
//! |---|---|
//! | `fact_lookup` | expected code contained in the answer (1 or 0) |
//! | `verbatim_recall` | exact match, else token F1 |
//! | `summary_checkpoint` | fraction of checkpoint names recalled |
//! | `continuation` | `exp(mean logprob | artifact - mean logprob | raw context)`, clipped to [0, 1] |
//!
//! Timed-out and rejected dispatches score zero without touching the model.
//! A failed or timed-out model call is an [`EvaluationError`]; the task is then
//! dropped from scoring rather than counted as zero.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::dispatch::DispatchOutcome;
use crate::inference::{GenerationParams, InferenceEngine, InferenceError, ModelInput};
use crate::metrics::ValidatorMetrics;
use condense_core::text::{contains_normalized, keyword_recall, normalize, token_f1};
use condense_core::{
    latency_score, CompressedArtifact, ExpectedAnswer, MinerId, OutcomeKind, ProbeKind,
    ScoreRecord, Task, Tier, TierId,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("reference model call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("reference model circuit is open")]
    CircuitOpen,

    #[error("task {task} belongs to tier {task_tier}, evaluated against {tier}")]
    TierMismatch {
        task: String,
        task_tier: TierId,
        tier: TierId,
    },

    #[error("evaluation pool unavailable: {0}")]
    PoolUnavailable(String),
}

/// Minimum per-probe score; anything below maps to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeThresholds {
    pub fact_lookup: f64,
    pub verbatim_recall: f64,
    pub continuation: f64,
    pub summary_checkpoint: f64,
}

impl Default for ProbeThresholds {
    fn default() -> Self {
        Self {
            fact_lookup: 0.0,
            verbatim_recall: 0.2,
            continuation: 0.05,
            summary_checkpoint: 0.0,
        }
    }
}

impl ProbeThresholds {
    pub fn floor(&self, kind: ProbeKind) -> f64 {
        match kind {
            ProbeKind::FactLookup => self.fact_lookup,
            ProbeKind::VerbatimRecall => self.verbatim_recall,
            ProbeKind::Continuation => self.continuation,
            ProbeKind::SummaryCheckpoint => self.summary_checkpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Timeout for a single reference model call
    pub inference_timeout_ms: u64,
    pub thresholds: ProbeThresholds,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            inference_timeout_ms: 30_000,
            thresholds: ProbeThresholds::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EvaluatorConfig {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
}

/// Score a generated answer against the expected answer.
pub fn score_answer(kind: ProbeKind, answer: &str, expected: &ExpectedAnswer) -> f64 {
    match (kind, expected) {
        (ProbeKind::SummaryCheckpoint, ExpectedAnswer::Keywords(keywords)) => {
            keyword_recall(answer, keywords)
        }
        (ProbeKind::FactLookup, _) => {
            if contains_normalized(answer, &expected.as_text()) {
                1.0
            } else {
                0.0
            }
        }
        (_, expected) => {
            let expected = expected.as_text();
            if normalize(answer) == normalize(&expected) {
                1.0
            } else {
                token_f1(answer, &expected)
            }
        }
    }
}

/// `exp(mean(compressed) - mean(raw))` clipped to [0, 1]; 0 for empty input.
pub fn likelihood_ratio(compressed: &[f64], raw: &[f64]) -> f64 {
    if compressed.is_empty() || raw.is_empty() {
        return 0.0;
    }
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let ratio = (mean(compressed) - mean(raw)).exp();
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

fn answer_budget(task: &Task) -> usize {
    match task.probe.kind {
        ProbeKind::FactLookup => 16,
        ProbeKind::SummaryCheckpoint => 64,
        _ => task.expected.as_text().split_whitespace().count() * 2 + 8,
    }
}

pub struct FidelityEvaluator {
    engine: Arc<dyn InferenceEngine>,
    config: EvaluatorConfig,
    breaker: CircuitBreaker,
    metrics: Option<ValidatorMetrics>,
}

impl FidelityEvaluator {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: EvaluatorConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        Self {
            engine,
            config,
            breaker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ValidatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn evaluate(
        &self,
        task: &Task,
        tier: &Tier,
        miner: &MinerId,
        outcome: &DispatchOutcome,
    ) -> Result<ScoreRecord, EvaluationError> {
        if task.tier != tier.id {
            return Err(EvaluationError::TierMismatch {
                task: task.id.to_string(),
                task_tier: task.tier.clone(),
                tier: tier.id.clone(),
            });
        }

        let (artifact, response_time) = match outcome {
            DispatchOutcome::TimedOut => {
                return Ok(ScoreRecord::zero(
                    miner.clone(),
                    tier.id.clone(),
                    task.id.clone(),
                    OutcomeKind::TimedOut,
                ))
            }
            DispatchOutcome::Rejected(_) => {
                return Ok(ScoreRecord::zero(
                    miner.clone(),
                    tier.id.clone(),
                    task.id.clone(),
                    OutcomeKind::Rejected,
                ))
            }
            DispatchOutcome::Fulfilled {
                artifact,
                response_time,
            } => (artifact, *response_time),
        };

        let started = Instant::now();
        let fidelity = match self.fidelity(task, tier, artifact).await {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    miner = %miner,
                    tier = %tier.id,
                    task = task.id.short(),
                    "Evaluation failed: {}",
                    e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_evaluation_failure(tier.id.as_str());
                }
                return Err(e);
            }
        };
        let latency = latency_score(response_time, tier.latency_budget());

        if let Some(metrics) = &self.metrics {
            metrics.record_evaluation(
                tier.id.as_str(),
                task.probe.kind.as_str(),
                fidelity,
                started.elapsed().as_secs_f64(),
            );
        }
        debug!(
            miner = %miner,
            tier = %tier.id,
            task = task.id.short(),
            "fidelity={:.3} latency={:.3}",
            fidelity,
            latency
        );

        Ok(ScoreRecord::new(
            miner.clone(),
            tier.id.clone(),
            task.id.clone(),
            fidelity,
            latency,
            OutcomeKind::Fulfilled,
        ))
    }

    /// Fidelity of `artifact` for `task`, after the per-probe floor.
    pub async fn fidelity(
        &self,
        task: &Task,
        tier: &Tier,
        artifact: &CompressedArtifact,
    ) -> Result<f64, EvaluationError> {
        let kind = task.probe.kind;
        let raw = match kind {
            ProbeKind::Continuation => {
                let target = task.expected.as_text();
                let compressed =
                    ModelInput::compressed(artifact.tokens.clone(), task.probe.prompt.clone());
                let reference =
                    ModelInput::text(format!("{}\n\n{}", task.context, task.probe.prompt));
                let with_artifact = self
                    .guarded(self.engine.log_likelihood(&tier.model, &compressed, &target))
                    .await?;
                let with_context = self
                    .guarded(self.engine.log_likelihood(&tier.model, &reference, &target))
                    .await?;
                likelihood_ratio(&with_artifact, &with_context)
            }
            _ => {
                let input =
                    ModelInput::compressed(artifact.tokens.clone(), task.probe.prompt.clone());
                let params = GenerationParams::greedy(answer_budget(task), task.seed);
                let answer = self
                    .guarded(self.engine.generate(&tier.model, &input, &params))
                    .await?;
                score_answer(kind, &answer, &task.expected)
            }
        };

        let floor = self.config.thresholds.floor(kind);
        Ok(if raw < floor { 0.0 } else { raw })
    }

    /// Run one engine call behind the circuit breaker and the call timeout.
    async fn guarded<T, F>(&self, call: F) -> Result<T, EvaluationError>
    where
        F: Future<Output = Result<T, InferenceError>>,
    {
        if !self.breaker.allow_request() {
            return Err(EvaluationError::CircuitOpen);
        }
        let timeout = self.config.inference_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e.into())
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(EvaluationError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::State;
    use async_trait::async_trait;
    use condense_core::{Probe, RequestId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers a fixed string after `delay`, or fails every call.
    struct ScriptedEngine {
        answer: Option<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
        params: Mutex<Vec<GenerationParams>>,
    }

    impl ScriptedEngine {
        fn answering(answer: &'static str) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(answer),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                params: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                params: Mutex::new(Vec::new()),
            })
        }

        fn stalled(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer: Some("42"),
                delay,
                calls: AtomicUsize::new(0),
                params: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _model: &str,
            _input: &ModelInput,
            params: &GenerationParams,
        ) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.params.lock().unwrap().push(params.clone());
            tokio::time::sleep(self.delay).await;
            self.answer
                .map(str::to_string)
                .ok_or_else(|| InferenceError::Status {
                    status: 503,
                    message: "model offline".into(),
                })
        }

        async fn log_likelihood(
            &self,
            _model: &str,
            _input: &ModelInput,
            _target: &str,
        ) -> Result<Vec<f64>, InferenceError> {
            Err(InferenceError::Request("not scripted".into()))
        }
    }

    fn tier() -> Tier {
        Tier::new("t0", (1, 1000), 8, "ref", Duration::from_secs(2))
    }

    fn recall_task() -> Task {
        Task::new(
            TierId::from("t0"),
            "On the amber harbor near the salt road the ferries wait.".into(),
            11,
            Probe::new(ProbeKind::VerbatimRecall, "Quote the words after 'On'."),
            ExpectedAnswer::Text("the amber harbor near the salt road".into()),
            1234,
        )
    }

    fn fulfilled() -> DispatchOutcome {
        DispatchOutcome::Fulfilled {
            artifact: CompressedArtifact::new(
                MinerId::from("m1"),
                RequestId::new(),
                vec![vec![0.25; 4]; 3],
            ),
            response_time: Duration::from_millis(500),
        }
    }

    fn evaluator(engine: Arc<ScriptedEngine>, config: EvaluatorConfig) -> FidelityEvaluator {
        FidelityEvaluator::new(engine, config)
    }

    #[test]
    fn test_fact_lookup_containment() {
        let expected = ExpectedAnswer::Text("42".into());
        assert_eq!(score_answer(ProbeKind::FactLookup, "The code is 42.", &expected), 1.0);
        assert_eq!(score_answer(ProbeKind::FactLookup, "It is 420", &expected), 0.0);
    }

    #[test]
    fn test_verbatim_exact_and_partial() {
        let expected = ExpectedAnswer::Text("the amber harbor near the salt road".into());
        assert_eq!(
            score_answer(
                ProbeKind::VerbatimRecall,
                "The amber harbor, near the salt road.",
                &expected
            ),
            1.0
        );
        let partial = score_answer(ProbeKind::VerbatimRecall, "the amber harbor", &expected);
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn test_summary_keyword_recall() {
        let expected = ExpectedAnswer::Keywords(vec!["Venqua".into(), "Dorlin".into()]);
        assert_eq!(
            score_answer(ProbeKind::SummaryCheckpoint, "Venqua; Dorlin", &expected),
            1.0
        );
        assert_eq!(
            score_answer(ProbeKind::SummaryCheckpoint, "Venqua", &expected),
            0.5
        );
    }

    #[test]
    fn test_likelihood_ratio() {
        assert_eq!(likelihood_ratio(&[-1.0, -1.0], &[-1.0, -1.0]), 1.0);
        let r = likelihood_ratio(&[-2.0], &[-1.0]);
        assert!((r - (-1.0f64).exp()).abs() < 1e-12);
        assert_eq!(likelihood_ratio(&[-0.5], &[-1.0]), 1.0);
        assert_eq!(likelihood_ratio(&[], &[-1.0]), 0.0);
        assert_eq!(likelihood_ratio(&[f64::NAN], &[-1.0]), 0.0);
    }

    #[test]
    fn test_threshold_floor() {
        let t = ProbeThresholds::default();
        assert_eq!(t.floor(ProbeKind::VerbatimRecall), 0.2);
        assert_eq!(t.floor(ProbeKind::FactLookup), 0.0);
    }

    #[tokio::test]
    async fn test_repeated_evaluation_is_stable() {
        let engine = ScriptedEngine::answering("the amber harbor");
        let ev = evaluator(engine.clone(), EvaluatorConfig::default());
        let task = recall_task();
        let miner = MinerId::from("m1");
        let outcome = fulfilled();

        let first = ev.evaluate(&task, &tier(), &miner, &outcome).await.unwrap();
        let second = ev.evaluate(&task, &tier(), &miner, &outcome).await.unwrap();
        assert!((first.fidelity - 0.6).abs() < 1e-12);
        assert_eq!(first.fidelity, second.fidelity);
        assert_eq!(first.latency, second.latency);

        let params = engine.params.lock().unwrap();
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(|p| p.temperature == 0.0 && p.seed == 1234));
        assert_eq!(params[0], params[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_engine_times_out() {
        let engine = ScriptedEngine::stalled(Duration::from_secs(60));
        let ev = evaluator(
            engine.clone(),
            EvaluatorConfig {
                inference_timeout_ms: 1_000,
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout_secs: 30,
                },
                ..Default::default()
            },
        );

        let err = ev
            .evaluate(&recall_task(), &tier(), &MinerId::from("m1"), &fulfilled())
            .await
            .unwrap_err();
        assert_eq!(err, EvaluationError::Timeout(Duration::from_secs(1)));
        assert_eq!(ev.breaker().state(), State::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_engine() {
        let engine = ScriptedEngine::failing();
        let ev = evaluator(
            engine.clone(),
            EvaluatorConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 2,
                    reset_timeout_secs: 30,
                },
                ..Default::default()
            },
        );
        let (task, miner, outcome) = (recall_task(), MinerId::from("m1"), fulfilled());

        for _ in 0..2 {
            let err = ev.evaluate(&task, &tier(), &miner, &outcome).await.unwrap_err();
            assert!(matches!(err, EvaluationError::Inference(_)), "{:?}", err);
        }
        let err = ev.evaluate(&task, &tier(), &miner, &outcome).await.unwrap_err();
        assert_eq!(err, EvaluationError::CircuitOpen);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ev.breaker().refused(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failures_never_reach_engine() {
        let engine = ScriptedEngine::failing();
        let ev = evaluator(engine.clone(), EvaluatorConfig::default());
        let record = ev
            .evaluate(
                &recall_task(),
                &tier(),
                &MinerId::from("m1"),
                &DispatchOutcome::TimedOut,
            )
            .await
            .unwrap();
        assert_eq!(record.fidelity, 0.0);
        assert_eq!(record.latency, 0.0);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }
}
