//! Integration tests for the dispatch → evaluate → aggregate path.
//!
//! Targets:
//! - deadline handling on a paused clock (fulfilled, timed out)
//! - over-long artifacts rejected before any model call
//! - trimmed-mean robustness to a single bad record
//! - truncating compressors losing to compressors that keep the relevant span

use async_trait::async_trait;
use chrono::Utc;
use condense_core::text::normalized_tokens;
use condense_core::{
    CompressionPayload, CompressionResponse, ExpectedAnswer, MinerId, MinerInfo, MinerMetadata,
    OutcomeKind, Probe, ProbeKind, ScoreRecord, Task, TaskId, Tier, TierId,
};
use condense_runtime::aggregation::{AggregationConfig, ScoreAggregator};
use condense_runtime::corpus::split_sentences;
use condense_runtime::dispatch::{DispatchOutcome, Dispatcher, MinerTransport, TransportError};
use condense_runtime::fidelity::{EvaluatorConfig, FidelityEvaluator};
use condense_runtime::inference::{GenerationParams, InferenceEngine, InferenceError, ModelInput};
use condense_runtime::window::WindowPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ==========================================================================
// Helpers
// ==========================================================================

/// Word ↔ soft-token codebook shared by the fake miners and the fake model.
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
                vec![idx as f32, 0.0, 0.0, 0.0]
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

#[derive(Clone, Copy)]
enum Strategy {
    /// First `max_compressed_tokens` words
    Truncate,
    /// Each distinct sentence once, in order
    DistinctSentences,
    /// A fixed number of filler soft tokens
    Fixed(usize),
}

struct FakeMiner {
    codebook: Arc<Codebook>,
    strategy: Strategy,
    delay: Duration,
}

#[async_trait]
impl MinerTransport for FakeMiner {
    async fn send_compression_request(
        &self,
        _miner: &MinerInfo,
        payload: &CompressionPayload,
    ) -> Result<CompressionResponse, TransportError> {
        tokio::time::sleep(self.delay).await;
        let compressed_tokens = match self.strategy {
            Strategy::Truncate => {
                let mut tokens = self.codebook.encode(&payload.context);
                tokens.truncate(payload.max_compressed_tokens);
                tokens
            }
            Strategy::DistinctSentences => {
                let mut seen: Vec<String> = Vec::new();
                for sentence in split_sentences(&payload.context) {
                    if !seen.contains(&sentence) {
                        seen.push(sentence);
                    }
                }
                let mut tokens = self.codebook.encode(&seen.join(" "));
                tokens.truncate(payload.max_compressed_tokens);
                tokens
            }
            Strategy::Fixed(n) => vec![vec![0.0, 0.0, 0.0, 0.0]; n],
        };
        Ok(CompressionResponse { compressed_tokens })
    }

    async fn fetch_metadata(&self, _miner: &MinerInfo) -> Result<MinerMetadata, TransportError> {
        Ok(MinerMetadata::default())
    }
}

/// Reads the decoded soft tokens and answers with the six words following the
/// prompt's last three words.
struct FakeModel {
    codebook: Arc<Codebook>,
    calls: AtomicUsize,
}

impl FakeModel {
    fn new(codebook: Arc<Codebook>) -> Self {
        Self {
            codebook,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for FakeModel {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(
        &self,
        _model: &str,
        input: &ModelInput,
        params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(params.temperature, 0.0);
        let ModelInput::Compressed {
            soft_tokens,
            prompt,
        } = input
        else {
            return Err(InferenceError::Request("expected compressed input".into()));
        };
        let words = self.codebook.decode(soft_tokens);
        let prompt = normalized_tokens(prompt);

        let prefix = &prompt[prompt.len().saturating_sub(3)..];
        let answer = words
            .windows(prefix.len())
            .position(|w| w == prefix)
            .map(|i| words[i + prefix.len()..].iter().take(6).cloned().collect::<Vec<_>>())
            .filter(|span| !span.is_empty())
            .map(|span| span.join(" "));
        Ok(answer.unwrap_or_else(|| "unknown".into()))
    }

    async fn log_likelihood(
        &self,
        _model: &str,
        _input: &ModelInput,
        target: &str,
    ) -> Result<Vec<f64>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![-1.0; target.split_whitespace().count().max(1)])
    }
}

fn inference_0() -> Tier {
    Tier::new(
        "inference_0",
        (256, 1536),
        64,
        "mistralai/Mistral-7B-Instruct-v0.2",
        Duration::from_secs(2),
    )
}

/// Fact "X=42" placed at token 200 of a 400-token context.
fn scenario_a_task() -> Task {
    let mut words: Vec<String> = (0..400).map(|i| format!("w{}", i % 50)).collect();
    words[199] = "X".into();
    words[200] = "is".into();
    words[201] = "42.".into();
    let context = words.join(" ");
    Task::new(
        TierId::from("inference_0"),
        context,
        400,
        Probe::new(ProbeKind::FactLookup, "What is X?"),
        ExpectedAnswer::Text("42".into()),
        17,
    )
}

fn miner_info(id: &str) -> MinerInfo {
    MinerInfo::new(id, format!("http://{id}.local"))
}

/// Answers "42" for anything.
struct FortyTwo {
    calls: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for FortyTwo {
    fn name(&self) -> &str {
        "forty-two"
    }

    async fn generate(
        &self,
        _model: &str,
        _input: &ModelInput,
        _params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("42".into())
    }

    async fn log_likelihood(
        &self,
        _model: &str,
        _input: &ModelInput,
        _target: &str,
    ) -> Result<Vec<f64>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![-1.0])
    }
}

async fn run_scenario(delay_ms: u64, strategy: Strategy) -> (DispatchOutcome, ScoreRecord, usize) {
    let codebook = Arc::new(Codebook::default());
    let dispatcher = Dispatcher::new(Arc::new(FakeMiner {
        codebook,
        strategy,
        delay: Duration::from_millis(delay_ms),
    }));
    let engine = Arc::new(FortyTwo {
        calls: AtomicUsize::new(0),
    });
    let evaluator = FidelityEvaluator::new(engine.clone(), EvaluatorConfig::default());

    let task = scenario_a_task();
    let tier = inference_0();
    let miner = miner_info("m1");
    let dispatched = dispatcher.dispatch(&task, &tier, &miner).await;
    let record = evaluator
        .evaluate(&task, &tier, &miner.id, &dispatched.outcome)
        .await
        .unwrap();
    (dispatched.outcome, record, engine.calls.load(Ordering::SeqCst))
}

// ==========================================================================
// Scenarios A-C: deadlines and artifact limits
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn scenario_a_fulfilled_within_budget() {
    let (outcome, record, calls) = run_scenario(500, Strategy::Fixed(32)).await;

    assert!(matches!(outcome, DispatchOutcome::Fulfilled { .. }));
    assert_eq!(record.outcome, OutcomeKind::Fulfilled);
    assert_eq!(record.fidelity, 1.0);
    assert!(
        (record.latency - 0.75).abs() < 0.01,
        "latency score {}",
        record.latency
    );
    assert_eq!(calls, 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_late_response_times_out_without_model_call() {
    let (outcome, record, calls) = run_scenario(2100, Strategy::Fixed(32)).await;

    assert_eq!(outcome, DispatchOutcome::TimedOut);
    assert_eq!(record.outcome, OutcomeKind::TimedOut);
    assert_eq!(record.fidelity, 0.0);
    assert_eq!(record.latency, 0.0);
    assert_eq!(calls, 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_overlong_artifact_rejected_without_model_call() {
    let (outcome, record, calls) = run_scenario(100, Strategy::Fixed(80)).await;

    assert!(matches!(outcome, DispatchOutcome::Rejected(_)));
    assert_eq!(record.outcome, OutcomeKind::Rejected);
    assert_eq!(record.fidelity, 0.0);
    assert_eq!(calls, 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_exactly_at_budget_scores_zero_latency() {
    let (outcome, record, _) = run_scenario(2000, Strategy::Fixed(8)).await;
    // The deadline fires first or the response lands with nothing left
    if let DispatchOutcome::Fulfilled { .. } = outcome {
        assert_eq!(record.latency, 0.0);
    } else {
        assert_eq!(outcome, DispatchOutcome::TimedOut);
    }
    assert_eq!(record.combined(), 0.0);
}

// ==========================================================================
// Scenario D: trimmed mean
// ==========================================================================

#[test]
fn scenario_d_single_zero_is_trimmed() {
    let config = AggregationConfig {
        window: WindowPolicy {
            max_records: 10,
            max_age_secs: None,
        },
        ..Default::default()
    };
    let mut agg = ScoreAggregator::new(config);
    let tier = TierId::from("inference_0");
    let miner = MinerId::from("m1");
    let probe = Probe::new(ProbeKind::FactLookup, "q");

    let records: Vec<ScoreRecord> = (0..10)
        .map(|i| {
            let fidelity = if i == 6 { 0.0 } else { 1.0 };
            ScoreRecord::new(
                miner.clone(),
                tier.clone(),
                TaskId::fingerprint(&tier, &format!("ctx {i}"), &probe),
                fidelity,
                1.0,
                OutcomeKind::Fulfilled,
            )
        })
        .collect();
    agg.append(records, Utc::now());

    assert_eq!(agg.windows().get(&miner, &tier).unwrap().len(), 10);
    assert_eq!(agg.tier_score(&miner, &tier), 1.0);
}

// ==========================================================================
// Truncation vs. span-preserving compression
// ==========================================================================

const KEY_SENTENCE: &str = "Captain Venqua buried an amber compass beneath northern lighthouse steps.";

fn verbatim_task(filler_sentences: usize) -> Task {
    let mut sentences = vec!["Rain fell softly again."; filler_sentences];
    sentences.push(KEY_SENTENCE);
    let context = sentences.join(" ");
    let tokens = context.split_whitespace().count();
    Task::new(
        TierId::from("inference_0"),
        context,
        tokens,
        Probe::new(
            ProbeKind::VerbatimRecall,
            "Repeat the text that follows: captain venqua buried",
        ),
        ExpectedAnswer::Text("an amber compass beneath northern lighthouse".into()),
        5,
    )
}

#[tokio::test(start_paused = true)]
async fn truncation_loses_to_span_preserving_summary() {
    for filler in [70usize, 120, 300] {
        let task = verbatim_task(filler);
        let tier = inference_0();
        let codebook = Arc::new(Codebook::default());
        let model = Arc::new(FakeModel::new(codebook.clone()));
        let evaluator = FidelityEvaluator::new(model.clone(), EvaluatorConfig::default());

        let mut fidelity = Vec::new();
        for strategy in [Strategy::Truncate, Strategy::DistinctSentences] {
            let dispatcher = Dispatcher::new(Arc::new(FakeMiner {
                codebook: codebook.clone(),
                strategy,
                delay: Duration::from_millis(200),
            }));
            let miner = miner_info("m");
            let dispatched = dispatcher.dispatch(&task, &tier, &miner).await;
            let record = evaluator
                .evaluate(&task, &tier, &miner.id, &dispatched.outcome)
                .await
                .unwrap();
            fidelity.push(record.fidelity);
        }

        assert!(
            fidelity[0] < fidelity[1],
            "filler {filler}: truncation {} vs summary {}",
            fidelity[0],
            fidelity[1]
        );
        assert_eq!(fidelity[1], 1.0);
        assert_eq!(model.calls(), 2);
    }
}
