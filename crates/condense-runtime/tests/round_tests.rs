//! Integration tests for complete validator rounds.
//!
//! Targets:
//! - mixed miner population: good, truncating, slow, oversized, unreachable
//! - weights normalized, failing miners at zero, model called only for artifacts
//! - skipped tiers, missing tier table, declared-tier eligibility
//! - reference model failures leave no trace in the score windows
//! - state persisted after a round and restored by a fresh validator

use async_trait::async_trait;
use condense_core::text::normalized_tokens;
use condense_core::{
    CompressionPayload, CompressionResponse, Eligibility, MinerId, MinerInfo, MinerMetadata,
    ProbeKind, Tier, TierId, Weights,
};
use condense_runtime::corpus::split_sentences;
use condense_runtime::dispatch::{MinerTransport, TransportError};
use condense_runtime::generator::{GeneratorConfig, ProbeMix, TaskGenerator};
use condense_runtime::inference::{GenerationParams, InferenceEngine, InferenceError, ModelInput};
use condense_runtime::metrics::ValidatorMetrics;
use condense_runtime::persistence::{MemoryWeightStore, WeightStore};
use condense_runtime::publisher::{PublishError, WeightSink};
use condense_runtime::registry::{RegistryError, TierRegistry};
use condense_runtime::validator::{Validator, ValidatorError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ==========================================================================
// Helpers
// ==========================================================================

#[derive(Default)]
struct Codebook {
    words: Mutex<Vec<String>>,
}

impl Codebook {
    fn encode(&self, text: &str) -> Vec<Vec<f32>> {
        let mut words = self.words.lock().unwrap();
        normalized_tokens(text)
            .into_iter()
            .map(|w| {
                let idx = match words.iter().position(|known| *known == w) {
                    Some(i) => i,
                    None => {
                        words.push(w);
                        words.len() - 1
                    }
                };
                vec![idx as f32, 1.0]
            })
            .collect()
    }

    fn decode(&self, tokens: &[Vec<f32>]) -> Vec<String> {
        let words = self.words.lock().unwrap();
        tokens
            .iter()
            .filter_map(|t| words.get(t[0] as usize).cloned())
            .collect()
    }
}

/// Behaviour chosen by miner key.
struct Population {
    codebook: Arc<Codebook>,
    /// Metadata replies; miners not listed answer 404
    declared: Vec<(MinerId, Option<TierId>)>,
}

#[async_trait]
impl MinerTransport for Population {
    async fn send_compression_request(
        &self,
        miner: &MinerInfo,
        payload: &CompressionPayload,
    ) -> Result<CompressionResponse, TransportError> {
        let budget = payload.max_compressed_tokens;
        let tokens = match miner.id.as_str() {
            "good" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let facts: Vec<String> = split_sentences(&payload.context)
                    .into_iter()
                    .filter(|s| s.chars().any(|c| c.is_ascii_digit()))
                    .collect();
                self.codebook.encode(&facts.join(" "))
            }
            "trunc" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let mut tokens = self.codebook.encode(&payload.context);
                tokens.truncate(budget);
                tokens
            }
            "slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                vec![vec![0.0, 1.0]; 4]
            }
            "bloat" => vec![vec![0.0, 1.0]; budget + 16],
            _ => return Err(TransportError::Connect("connection refused".into())),
        };
        Ok(CompressionResponse {
            compressed_tokens: tokens,
        })
    }

    async fn fetch_metadata(&self, miner: &MinerInfo) -> Result<MinerMetadata, TransportError> {
        match self.declared.iter().find(|(id, _)| *id == miner.id) {
            Some((_, tier)) => Ok(MinerMetadata { tier: tier.clone() }),
            None => Err(TransportError::Status(404)),
        }
    }
}

/// Answers access-code questions from the decoded soft tokens.
struct FactModel {
    codebook: Arc<Codebook>,
    calls: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for FactModel {
    fn name(&self) -> &str {
        "fact-model"
    }

    async fn generate(
        &self,
        _model: &str,
        input: &ModelInput,
        _params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ModelInput::Compressed {
            soft_tokens,
            prompt,
        } = input
        else {
            return Err(InferenceError::Request("expected compressed input".into()));
        };
        let prompt = normalized_tokens(prompt);
        let entity = prompt
            .iter()
            .position(|w| w == "for")
            .and_then(|i| prompt.get(i + 1))
            .cloned()
            .unwrap_or_default();

        let words = self.codebook.decode(soft_tokens);
        let answer = words
            .windows(5)
            .find(|w| w[0] == "code" && w[1] == "for" && w[2] == entity && w[3] == "is")
            .map(|w| w[4].clone());
        Ok(answer.unwrap_or_else(|| "unknown".into()))
    }

    async fn log_likelihood(
        &self,
        _model: &str,
        _input: &ModelInput,
        _target: &str,
    ) -> Result<Vec<f64>, InferenceError> {
        Err(InferenceError::Request("not used".into()))
    }
}

/// Reference model that is down.
struct OfflineModel {
    calls: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for OfflineModel {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate(
        &self,
        _model: &str,
        _input: &ModelInput,
        _params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Status {
            status: 503,
            message: "no replicas".into(),
        })
    }

    async fn log_likelihood(
        &self,
        _model: &str,
        _input: &ModelInput,
        _target: &str,
    ) -> Result<Vec<f64>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Request("no replicas".into()))
    }
}

#[derive(Default)]
struct RecordingSink {
    rounds: Mutex<Vec<(u64, Weights)>>,
}

#[async_trait]
impl WeightSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit_weights(&self, round: u64, weights: &Weights) -> Result<(), PublishError> {
        self.rounds.lock().unwrap().push((round, weights.clone()));
        Ok(())
    }
}

fn tier() -> Tier {
    Tier::new("inference_0", (256, 512), 64, "ref-model", Duration::from_secs(2))
}

fn roster() -> Vec<MinerInfo> {
    ["good", "trunc", "slow", "bloat", "down"]
        .iter()
        .map(|id| MinerInfo::new(*id, format!("http://{id}.local")))
        .collect()
}

fn assert_close(a: &Weights, b: &Weights) {
    assert_eq!(a.len(), b.len());
    for (miner, w) in b.iter() {
        assert!((a.get(miner) - w).abs() < 1e-12, "{miner}: {} vs {w}", a.get(miner));
    }
}

struct Harness {
    codebook: Arc<Codebook>,
    model: Arc<FactModel>,
    sink: Arc<RecordingSink>,
    metrics: ValidatorMetrics,
}

impl Harness {
    fn new() -> Self {
        let codebook = Arc::new(Codebook::default());
        Self {
            model: Arc::new(FactModel {
                codebook: codebook.clone(),
                calls: AtomicUsize::new(0),
            }),
            codebook,
            sink: Arc::new(RecordingSink::default()),
            metrics: ValidatorMetrics::new(),
        }
    }

    fn validator(
        &self,
        registry: TierRegistry,
        declared: Vec<(MinerId, Option<TierId>)>,
        store: Option<Arc<dyn WeightStore>>,
    ) -> Validator {
        self.validator_with_engine(registry, declared, store, self.model.clone())
    }

    fn validator_with_engine(
        &self,
        registry: TierRegistry,
        declared: Vec<(MinerId, Option<TierId>)>,
        store: Option<Arc<dyn WeightStore>>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Validator {
        let generator = TaskGenerator::synthetic(GeneratorConfig {
            seed: Some(3),
            probe_mix: ProbeMix::only(ProbeKind::FactLookup),
            ..Default::default()
        });
        let mut builder = Validator::builder(
            Arc::new(registry),
            Arc::new(Population {
                codebook: self.codebook.clone(),
                declared,
            }),
            engine,
            self.sink.clone(),
        )
        .generator(generator)
        .metrics(self.metrics.clone());
        if let Some(store) = store {
            builder = builder.store(store);
        }
        builder.build()
    }
}

// ==========================================================================
// Full round
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn round_scores_mixed_population() {
    let harness = Harness::new();
    let registry = TierRegistry::from_tiers(vec![tier()]).unwrap();
    let mut validator = harness.validator(registry, Vec::new(), None);

    let report = validator.run_round(&roster()).await.unwrap();

    assert_eq!(report.round, 1);
    assert_eq!(report.tasks, 1);
    assert_eq!(report.dispatched, 5);
    assert_eq!(report.fulfilled, 2);
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.evaluation_failures, 0);
    assert_eq!(report.scores.len(), 5);
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 2);

    let weights = report.weights.expect("weights published");
    assert!(weights.is_normalized());
    let w = |id: &str| weights.get(&MinerId::from(id));
    assert!(w("good") > 0.0);
    assert!(w("good") >= w("trunc"));
    assert_eq!(w("slow"), 0.0);
    assert_eq!(w("bloat"), 0.0);
    assert_eq!(w("down"), 0.0);

    assert!(report.published);
    assert_eq!(harness.sink.rounds.lock().unwrap()[0].0, 1);
    assert!(harness.metrics.gather().contains("condense_rounds_total 1"));
}

#[tokio::test(start_paused = true)]
async fn unbuildable_tier_is_skipped_and_round_continues() {
    let harness = Harness::new();
    let cramped = Tier::new("cramped", (256, 512), 64, "ref-model", Duration::from_secs(2))
        .with_max_context_chars(20);
    let registry = TierRegistry::from_tiers(vec![cramped, tier()]).unwrap();
    let mut validator = harness.validator(registry, Vec::new(), None);

    let report = validator.run_round(&roster()).await.unwrap();

    assert_eq!(report.skipped_tiers, vec![TierId::from("cramped")]);
    assert_eq!(report.tasks, 1);
    assert_eq!(report.dispatched, 5);
    assert!(harness.metrics.gather().contains("condense_tiers_skipped_total"));
}

#[tokio::test]
async fn missing_tier_table_fails_the_round() {
    let harness = Harness::new();
    let mut validator = harness.validator(TierRegistry::empty(), Vec::new(), None);

    let err = validator.run_round(&roster()).await.unwrap_err();
    assert!(matches!(
        err,
        ValidatorError::Registry(RegistryError::Unavailable)
    ));
    assert_eq!(validator.round(), 0);
    assert!(harness.sink.rounds.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn declared_tier_eligibility_uses_metadata() {
    let harness = Harness::new();
    let registry =
        TierRegistry::from_tiers(vec![tier().with_eligibility(Eligibility::DeclaredTier)])
            .unwrap();
    let declared = vec![(MinerId::from("good"), Some(TierId::from("inference_0")))];
    let mut validator = harness.validator(registry, declared, None);

    let mut miners = roster();
    validator.refresh_metadata(&mut miners).await;
    assert_eq!(
        miners[0].declared_tier,
        Some(TierId::from("inference_0"))
    );
    assert!(miners[1..].iter().all(|m| m.declared_tier.is_none()));

    let report = validator.run_round(&miners).await.unwrap();
    assert_eq!(report.dispatched, 1);
    let weights = report.weights.unwrap();
    assert_eq!(weights.get(&MinerId::from("good")), 1.0);
}

#[tokio::test]
async fn metadata_without_tier_clears_declaration() {
    let harness = Harness::new();
    let registry = TierRegistry::from_tiers(vec![tier()]).unwrap();
    let declared = vec![
        (MinerId::from("good"), None),
        (MinerId::from("trunc"), Some(TierId::from("inference_0"))),
    ];
    let validator = harness.validator(registry, declared, None);

    let mut miners = roster();
    for miner in &mut miners {
        miner.declared_tier = Some(TierId::from("inference_1"));
    }
    validator.refresh_metadata(&mut miners).await;

    assert_eq!(miners[0].declared_tier, None);
    assert_eq!(miners[1].declared_tier, Some(TierId::from("inference_0")));
    // No answer keeps the last declaration.
    assert_eq!(miners[2].declared_tier, Some(TierId::from("inference_1")));
}

// ==========================================================================
// Reference model failures
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn failed_evaluations_are_excluded_not_zeroed() {
    let harness = Harness::new();
    let registry = TierRegistry::from_tiers(vec![tier()]).unwrap();
    let offline = Arc::new(OfflineModel {
        calls: AtomicUsize::new(0),
    });
    let mut validator =
        harness.validator_with_engine(registry, Vec::new(), None, offline.clone());
    let miners: Vec<MinerInfo> = roster().into_iter().take(2).collect();

    let report = validator.run_round(&miners).await.unwrap();

    assert_eq!(report.fulfilled, 2);
    assert_eq!(report.evaluation_failures, 2);
    assert!(report.scores.is_empty());
    assert!(validator.aggregator().windows().is_empty());
    assert!(validator
        .aggregator()
        .windows()
        .get(&MinerId::from("good"), &TierId::from("inference_0"))
        .is_none());
    assert!(report.weights.is_none());
    assert!(!report.published);
    assert!(harness.sink.rounds.lock().unwrap().is_empty());
    assert_eq!(offline.calls.load(Ordering::SeqCst), 2);
    assert_eq!(validator.round(), 1);
    assert!(harness
        .metrics
        .gather()
        .contains("condense_evaluation_failures_total"));
}

#[tokio::test(start_paused = true)]
async fn failed_evaluations_leave_other_miners_scored() {
    let harness = Harness::new();
    let registry = TierRegistry::from_tiers(vec![tier()]).unwrap();
    let offline = Arc::new(OfflineModel {
        calls: AtomicUsize::new(0),
    });
    let mut validator = harness.validator_with_engine(registry, Vec::new(), None, offline);

    let report = validator.run_round(&roster()).await.unwrap();

    assert_eq!(report.evaluation_failures, 2);
    assert_eq!(report.scores.len(), 3);
    assert!(report.scores.iter().all(|r| r.fidelity == 0.0));
    let windows = validator.aggregator().windows();
    let tier_id = TierId::from("inference_0");
    assert!(windows.get(&MinerId::from("good"), &tier_id).is_none());
    assert!(windows.get(&MinerId::from("trunc"), &tier_id).is_none());
    assert_eq!(windows.get(&MinerId::from("slow"), &tier_id).unwrap().len(), 1);
    assert!(report.weights.is_none());
}

// ==========================================================================
// Persistence across restarts
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn state_survives_restart() {
    let harness = Harness::new();
    let store: Arc<dyn WeightStore> = Arc::new(MemoryWeightStore::new());

    let published = {
        let registry = TierRegistry::from_tiers(vec![tier()]).unwrap();
        let mut validator = harness.validator(registry, Vec::new(), Some(store.clone()));
        validator.run_round(&roster()).await.unwrap().weights.unwrap()
    };

    let snapshot = store.load_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.round, 1);
    assert_close(&snapshot.weights, &published);
    assert_eq!(snapshot.scores.len(), 5);

    let registry = TierRegistry::from_tiers(vec![tier()]).unwrap();
    let mut restarted = harness.validator(registry, Vec::new(), Some(store));
    assert!(restarted.restore().unwrap());
    assert_eq!(restarted.round(), 1);
    assert_close(restarted.aggregator().previous().unwrap(), &published);

    let report = restarted.run_round(&roster()).await.unwrap();
    assert_eq!(report.round, 2);
    assert!(report.weights.unwrap().is_normalized());
}
