//! Synthetic task generation.
//!
//! A task is a context assembled from corpus passages plus a probe whose
//! answer is planted in (or taken from) that context. Every task is derived
//! from a single `u64` seed, so [`TaskGenerator::generate_with_seed`] is
//! reproducible for auditing.
//!
//! | Probe kind | Planted material | Expected answer |
//! |---|---|---|
//! | `fact_lookup` | "The access code for `<name>` is `<code>`." | the code |
//! | `verbatim_recall` | none; a span is picked uniformly over the context | the span |
//! | `continuation` | none; a sentence is picked from the context | the sentence tail |
//! | `summary_checkpoint` | 3 to 5 "Checkpoint `<name>` was confirmed." lines | the names |

use crate::corpus::{split_sentences, synthetic_name, CorpusSource, SyntheticCorpus};
use crate::limits::MAX_PASSAGE_DRAWS;
use condense_core::{
    ExpectedAnswer, Probe, ProbeKind, Task, TaskId, Tier, TierId, Tokenizer, WhitespaceTokenizer,
};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const VERBATIM_PREFIX_WORDS: usize = 4;
const VERBATIM_SPAN_WORDS: (usize, usize) = (6, 16);
const CONTINUATION_HEAD_WORDS: usize = 4;
const CONTINUATION_MIN_WORDS: usize = 8;
const CHECKPOINTS: (usize, usize) = (3, 5);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("task generation exhausted for tier {tier} after {attempts} attempts")]
    Exhausted { tier: TierId, attempts: usize },

    #[error("could not build a {kind} task for tier {tier}: {reason}")]
    Unfit {
        tier: TierId,
        kind: ProbeKind,
        reason: String,
    },
}

/// Relative frequency of each probe kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeMix {
    pub fact_lookup: f64,
    pub verbatim_recall: f64,
    pub continuation: f64,
    pub summary_checkpoint: f64,
}

impl Default for ProbeMix {
    fn default() -> Self {
        Self {
            fact_lookup: 1.0,
            verbatim_recall: 1.0,
            continuation: 1.0,
            summary_checkpoint: 1.0,
        }
    }
}

impl ProbeMix {
    pub fn only(kind: ProbeKind) -> Self {
        let mut mix = Self {
            fact_lookup: 0.0,
            verbatim_recall: 0.0,
            continuation: 0.0,
            summary_checkpoint: 0.0,
        };
        *mix.weight_mut(kind) = 1.0;
        mix
    }

    pub fn weight(&self, kind: ProbeKind) -> f64 {
        match kind {
            ProbeKind::FactLookup => self.fact_lookup,
            ProbeKind::VerbatimRecall => self.verbatim_recall,
            ProbeKind::Continuation => self.continuation,
            ProbeKind::SummaryCheckpoint => self.summary_checkpoint,
        }
    }

    fn weight_mut(&mut self, kind: ProbeKind) -> &mut f64 {
        match kind {
            ProbeKind::FactLookup => &mut self.fact_lookup,
            ProbeKind::VerbatimRecall => &mut self.verbatim_recall,
            ProbeKind::Continuation => &mut self.continuation,
            ProbeKind::SummaryCheckpoint => &mut self.summary_checkpoint,
        }
    }

    fn distribution(&self) -> Option<WeightedIndex<f64>> {
        let weights: Vec<f64> = ProbeKind::ALL
            .iter()
            .map(|k| {
                let w = self.weight(*k);
                if w.is_finite() && w > 0.0 {
                    w
                } else {
                    0.0
                }
            })
            .collect();
        WeightedIndex::new(weights).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Seed for the generator's own RNG; entropy when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Number of recent task fingerprints that may not repeat
    pub dedup_horizon: usize,
    /// Attempts per `generate` call before giving up on a tier
    pub max_attempts: usize,
    pub probe_mix: ProbeMix,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: None,
            dedup_horizon: 1024,
            max_attempts: 8,
            probe_mix: ProbeMix::default(),
        }
    }
}

pub struct TaskGenerator {
    config: GeneratorConfig,
    sources: Vec<Arc<dyn CorpusSource>>,
    tokenizer: Arc<dyn Tokenizer>,
    rng: StdRng,
    kinds: Option<WeightedIndex<f64>>,
    recent: VecDeque<TaskId>,
    recent_set: FxHashSet<TaskId>,
}

impl TaskGenerator {
    pub fn new(
        config: GeneratorConfig,
        sources: Vec<Arc<dyn CorpusSource>>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let kinds = config.probe_mix.distribution();
        if kinds.is_none() {
            warn!("Probe mix has no positive weight; falling back to a uniform mix");
        }
        Self {
            config,
            sources,
            tokenizer,
            rng,
            kinds,
            recent: VecDeque::new(),
            recent_set: FxHashSet::default(),
        }
    }

    /// Synthetic corpus and whitespace tokenizer.
    pub fn synthetic(config: GeneratorConfig) -> Self {
        Self::new(
            config,
            vec![Arc::new(SyntheticCorpus::new())],
            Arc::new(WhitespaceTokenizer),
        )
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Produce a fresh task for `tier`, retrying on unfit contexts and on
    /// repeats within the de-duplication horizon.
    pub fn generate(&mut self, tier: &Tier) -> Result<Task, GenerationError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let seed: u64 = self.rng.gen();
            let kind = self.next_kind();
            match self.generate_with_seed(tier, kind, seed) {
                Ok(task) if self.recent_set.contains(&task.id) => {
                    debug!(
                        "Task {} for tier {} repeats within horizon (attempt {})",
                        task.id.short(),
                        tier.id,
                        attempt
                    );
                }
                Ok(task) => {
                    self.remember(task.id.clone());
                    return Ok(task);
                }
                Err(e) => debug!("Attempt {} failed: {}", attempt, e),
            }
        }
        Err(GenerationError::Exhausted {
            tier: tier.id.clone(),
            attempts,
        })
    }

    fn next_kind(&mut self) -> ProbeKind {
        match &self.kinds {
            Some(dist) => ProbeKind::ALL[dist.sample(&mut self.rng)],
            None => ProbeKind::ALL[self.rng.gen_range(0..ProbeKind::ALL.len())],
        }
    }

    fn remember(&mut self, id: TaskId) {
        if self.config.dedup_horizon == 0 {
            return;
        }
        while self.recent.len() >= self.config.dedup_horizon {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        self.recent_set.insert(id.clone());
        self.recent.push_back(id);
    }

    pub fn is_recent(&self, id: &TaskId) -> bool {
        self.recent_set.contains(id)
    }

    /// Build the task determined by `(tier, kind, seed)`. Does not consult or
    /// update the de-duplication horizon.
    pub fn generate_with_seed(
        &self,
        tier: &Tier,
        kind: ProbeKind,
        seed: u64,
    ) -> Result<Task, GenerationError> {
        let unfit = |reason: &str| GenerationError::Unfit {
            tier: tier.id.clone(),
            kind,
            reason: reason.to_string(),
        };
        if self.sources.is_empty() {
            return Err(unfit("no corpus sources"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let target = rng.gen_range(tier.min_context_tokens..=tier.max_context_tokens);

        let planted = match kind {
            ProbeKind::FactLookup => Planted::fact(&mut rng),
            ProbeKind::SummaryCheckpoint => Planted::checkpoints(&mut rng),
            ProbeKind::VerbatimRecall | ProbeKind::Continuation => Planted::none(),
        };
        let planted_tokens: usize = planted
            .sentences
            .iter()
            .map(|s| self.tokenizer.count(s))
            .sum();
        let planted_chars: usize = planted.sentences.iter().map(|s| s.chars().count() + 1).sum();

        let budget_tokens = target.saturating_sub(planted_tokens);
        let budget_chars = tier
            .max_context_chars
            .map(|max| max.saturating_sub(planted_chars));
        let mut sentences = self.fill(&mut rng, budget_tokens, budget_chars)?;
        if sentences.is_empty() {
            return Err(unfit("corpus yielded no text"));
        }

        planted.insert_into(&mut sentences, &mut rng);
        let context = sentences.join(" ");

        let (probe, expected) = match kind {
            ProbeKind::FactLookup | ProbeKind::SummaryCheckpoint => planted
                .probe
                .ok_or_else(|| unfit("missing planted probe"))?,
            ProbeKind::VerbatimRecall => {
                verbatim_probe(&context, &mut rng).ok_or_else(|| unfit("no unique span"))?
            }
            ProbeKind::Continuation => continuation_probe(&sentences, &mut rng)
                .ok_or_else(|| unfit("no sentence long enough"))?,
        };

        let tokens = self.tokenizer.count(&context);
        let chars = context.chars().count();
        if !tier.accepts_context(tokens, chars) {
            return Err(unfit(&format!(
                "context of {} tokens / {} chars outside bounds [{}, {}]",
                tokens, chars, tier.min_context_tokens, tier.max_context_tokens
            )));
        }

        Ok(Task::new(
            tier.id.clone(),
            context,
            tokens,
            probe,
            expected,
            seed,
        ))
    }

    /// Draw sentences until the token budget is met, cutting the last one to
    /// land on the budget exactly.
    fn fill(
        &self,
        rng: &mut StdRng,
        budget_tokens: usize,
        budget_chars: Option<usize>,
    ) -> Result<Vec<String>, GenerationError> {
        let mut out = Vec::new();
        let mut tokens = 0usize;
        let mut chars = 0usize;
        let mut draws = 0usize;

        'outer: while tokens < budget_tokens {
            if draws >= MAX_PASSAGE_DRAWS {
                break;
            }
            draws += 1;
            let source = &self.sources[rng.gen_range(0..self.sources.len())];
            let Some(passage) = source.sample(rng) else {
                continue;
            };
            for sentence in split_sentences(&passage) {
                let n = self.tokenizer.count(&sentence);
                let c = sentence.chars().count() + 1;
                if budget_chars.is_some_and(|max| chars + c > max) {
                    break 'outer;
                }
                if tokens + n > budget_tokens {
                    let keep = budget_tokens - tokens;
                    if keep > 0 {
                        let cut = sentence
                            .split_whitespace()
                            .take(keep)
                            .collect::<Vec<_>>()
                            .join(" ");
                        out.push(cut);
                    }
                    break 'outer;
                }
                tokens += n;
                chars += c;
                out.push(sentence);
            }
        }
        Ok(out)
    }
}

/// Sentences planted into a context and the probe they support.
struct Planted {
    sentences: Vec<String>,
    probe: Option<(Probe, ExpectedAnswer)>,
    spread: bool,
}

impl Planted {
    fn none() -> Self {
        Self {
            sentences: Vec::new(),
            probe: None,
            spread: false,
        }
    }

    fn fact(rng: &mut StdRng) -> Self {
        let entity = synthetic_name(rng);
        let code = rng.gen_range(10_000..100_000u32).to_string();
        Self {
            sentences: vec![format!("The access code for {} is {}.", entity, code)],
            probe: Some((
                Probe::new(
                    ProbeKind::FactLookup,
                    format!(
                        "What is the access code for {}? Answer with the code only.",
                        entity
                    ),
                ),
                ExpectedAnswer::Text(code),
            )),
            spread: false,
        }
    }

    fn checkpoints(rng: &mut StdRng) -> Self {
        let n = rng.gen_range(CHECKPOINTS.0..=CHECKPOINTS.1);
        let mut names: Vec<String> = Vec::with_capacity(n);
        while names.len() < n {
            let name = synthetic_name(rng);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Self {
            sentences: names
                .iter()
                .map(|k| format!("Checkpoint {} was confirmed.", k))
                .collect(),
            probe: Some((
                Probe::new(
                    ProbeKind::SummaryCheckpoint,
                    "List the names of every checkpoint confirmed in the text.",
                ),
                ExpectedAnswer::Keywords(names),
            )),
            spread: true,
        }
    }

    /// Insert at random sentence boundaries; spread inserts land in separate
    /// segments of the context.
    fn insert_into(&self, sentences: &mut Vec<String>, rng: &mut StdRng) {
        if self.sentences.is_empty() {
            return;
        }
        if !self.spread {
            for s in &self.sentences {
                let at = rng.gen_range(0..=sentences.len());
                sentences.insert(at, s.clone());
            }
            return;
        }
        let n = self.sentences.len();
        let len = sentences.len();
        let mut positions: Vec<usize> = (0..n)
            .map(|i| {
                let lo = i * len / n;
                let hi = ((i + 1) * len / n).max(lo);
                rng.gen_range(lo..=hi)
            })
            .collect();
        positions.sort_unstable();
        // insert from the back so earlier positions stay valid
        for (s, at) in self.sentences.iter().zip(positions).rev() {
            sentences.insert(at, s.clone());
        }
    }
}

fn verbatim_probe(context: &str, rng: &mut StdRng) -> Option<(Probe, ExpectedAnswer)> {
    let words: Vec<&str> = context.split_whitespace().collect();
    if words.len() < VERBATIM_PREFIX_WORDS + VERBATIM_SPAN_WORDS.0 {
        return None;
    }
    for _ in 0..32 {
        let max_span = VERBATIM_SPAN_WORDS
            .1
            .min(words.len() - VERBATIM_PREFIX_WORDS);
        let span = rng.gen_range(VERBATIM_SPAN_WORDS.0..=max_span);
        let start = rng.gen_range(VERBATIM_PREFIX_WORDS..=words.len() - span);
        let prefix = words[start - VERBATIM_PREFIX_WORDS..start].join(" ");
        if context.matches(prefix.as_str()).count() != 1 {
            continue;
        }
        let answer = words[start..start + span].join(" ");
        let prompt = format!(
            "Repeat exactly the {} words that follow \"{}\" in the text.",
            span, prefix
        );
        return Some((
            Probe::new(ProbeKind::VerbatimRecall, prompt),
            ExpectedAnswer::Text(answer),
        ));
    }
    None
}

fn continuation_probe(sentences: &[String], rng: &mut StdRng) -> Option<(Probe, ExpectedAnswer)> {
    let candidates: Vec<&String> = sentences
        .iter()
        .filter(|s| s.split_whitespace().count() >= CONTINUATION_MIN_WORDS)
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let sentence = candidates[rng.gen_range(0..candidates.len())];
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let head = words[..CONTINUATION_HEAD_WORDS].join(" ");
    let tail = words[CONTINUATION_HEAD_WORDS..].join(" ");
    Some((
        Probe::new(
            ProbeKind::Continuation,
            format!("Continue this sentence from the text: \"{}\"", head),
        ),
        ExpectedAnswer::Text(tail),
    ))
}
