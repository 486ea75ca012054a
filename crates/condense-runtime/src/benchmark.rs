//! Task generation benchmark.
//!
//! Generates a batch of tasks per tier and reports generation time and
//! context size statistics, optionally keeping the tasks for inspection.

use crate::generator::TaskGenerator;
use condense_core::{ProbeKind, Task, Tier, TierId};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{info, warn};

/// Mean and population standard deviation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stat {
    pub mean: f64,
    pub std: f64,
}

impl Stat {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierBenchmark {
    pub tier: TierId,
    pub requested: usize,
    pub generated: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub generation_ms: Stat,
    pub context_chars: Stat,
    pub context_tokens: Stat,
    /// Generated tasks per probe kind
    pub probes: BTreeMap<ProbeKind, usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub tiers: Vec<TierBenchmark>,
}

/// Generate `count` tasks for each tier. Generation failures are counted, not
/// fatal.
pub fn run_generation_benchmark(
    generator: &mut TaskGenerator,
    tiers: &[Tier],
    count: usize,
    keep_samples: bool,
) -> BenchmarkReport {
    let mut report = BenchmarkReport { tiers: Vec::new() };

    for tier in tiers {
        let mut times = Vec::with_capacity(count);
        let mut chars = Vec::with_capacity(count);
        let mut tokens = Vec::with_capacity(count);
        let mut probes = BTreeMap::new();
        let mut samples = Vec::new();
        let mut errors = 0;

        for _ in 0..count {
            let started = Instant::now();
            match generator.generate(tier) {
                Ok(task) => {
                    times.push(started.elapsed().as_secs_f64() * 1000.0);
                    chars.push(task.context.chars().count() as f64);
                    tokens.push(task.context_tokens as f64);
                    *probes.entry(task.probe.kind).or_insert(0) += 1;
                    if keep_samples {
                        samples.push(task);
                    }
                }
                Err(e) => {
                    warn!(tier = %tier.id, "Generation failed: {}", e);
                    errors += 1;
                }
            }
        }

        let bench = TierBenchmark {
            tier: tier.id.clone(),
            requested: count,
            generated: count - errors,
            errors,
            error_rate: if count == 0 {
                0.0
            } else {
                errors as f64 / count as f64
            },
            generation_ms: Stat::of(&times),
            context_chars: Stat::of(&chars),
            context_tokens: Stat::of(&tokens),
            probes,
            samples,
        };
        info!(
            tier = %bench.tier,
            generated = bench.generated,
            errors = bench.errors,
            "mean {:.2}ms, {:.0} tokens",
            bench.generation_ms.mean,
            bench.context_tokens.mean
        );
        report.tiers.push(bench);
    }

    report
}
