//! Score aggregation
//!
//! Turns rolling score windows into normalized incentive weights:
//!
//! 1. per (miner, tier): trimmed mean of `fidelity * latency`
//! 2. per miner: `sum(tier.importance * tier_mean)` over the current tier table
//! 3. normalize across the roster, then blend with the previously published
//!    weights
//!
//! [`ScoreAggregator::aggregate`] reads state only; [`ScoreAggregator::commit`]
//! records what was actually published.

use crate::window::{WindowPolicy, WindowSet};
use chrono::{DateTime, Utc};
use condense_core::{MinerId, ScoreRecord, TierId, TierTable, Weights};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub window: WindowPolicy,
    /// Records dropped from each end before averaging
    pub trim: usize,
    /// Windows shorter than this are averaged untrimmed
    pub min_records_for_trim: usize,
    /// Weight of the new round in `alpha * new + (1 - alpha) * previous`
    pub smoothing: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window: WindowPolicy::default(),
            trim: 1,
            min_records_for_trim: 3,
            smoothing: 0.2,
        }
    }
}

/// Mean after dropping `trim` lowest and `trim` highest values. Trimming only
/// applies when at least `min_records` values are present and something
/// remains afterwards. NaN counts as 0.
pub fn trimmed_mean(values: &[f64], trim: usize, min_records: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values
        .iter()
        .map(|v| if v.is_nan() { 0.0 } else { *v })
        .collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let kept = if sorted.len() >= min_records.max(1) && sorted.len() > 2 * trim {
        &sorted[trim..sorted.len() - trim]
    } else {
        &sorted[..]
    };
    kept.iter().sum::<f64>() / kept.len() as f64
}

pub struct ScoreAggregator {
    config: AggregationConfig,
    windows: WindowSet,
    published: Option<Weights>,
}

impl ScoreAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        let windows = WindowSet::new(config.window.clone());
        Self {
            config,
            windows,
            published: None,
        }
    }

    /// Start from weights published before a restart.
    pub fn with_previous(mut self, weights: Weights) -> Self {
        self.published = Some(weights);
        self
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn windows(&self) -> &WindowSet {
        &self.windows
    }

    pub fn append<I>(&mut self, records: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = ScoreRecord>,
    {
        for record in records {
            self.windows.append(record, now);
        }
        self.windows.evict(now);
    }

    pub fn restore_windows(&mut self, records: Vec<ScoreRecord>, now: DateTime<Utc>) {
        self.windows.restore(records, now);
        self.windows.evict(now);
    }

    /// Trimmed mean for one (miner, tier); 0 when the window is empty.
    pub fn tier_score(&self, miner: &MinerId, tier: &TierId) -> f64 {
        self.windows
            .get(miner, tier)
            .map(|w| {
                trimmed_mean(
                    &w.combined_scores(),
                    self.config.trim,
                    self.config.min_records_for_trim,
                )
            })
            .unwrap_or(0.0)
    }

    /// Importance-weighted sum of tier scores for every roster miner.
    pub fn raw_scores(&self, tiers: &TierTable, roster: &[MinerId]) -> Vec<(MinerId, f64)> {
        roster
            .iter()
            .map(|miner| {
                let score: f64 = tiers
                    .iter()
                    .map(|tier| tier.importance * self.tier_score(miner, &tier.id))
                    .sum();
                (miner.clone(), score)
            })
            .collect()
    }

    /// Weights to publish this round, or the previous weights when no miner
    /// scored. Previous weights only carry over for miners still on the
    /// roster. `None` when there is nothing to publish at all.
    pub fn aggregate(&self, tiers: &TierTable, roster: &[MinerId]) -> Option<Weights> {
        let previous = self
            .published
            .as_ref()
            .and_then(|p| p.restricted_to(roster));
        match (Weights::normalize(self.raw_scores(tiers, roster)), previous) {
            (Some(fresh), Some(previous)) => Some(fresh.blend(&previous, self.config.smoothing)),
            (Some(fresh), None) => Some(fresh),
            (None, previous) => previous,
        }
    }

    /// Record the weights that were published.
    pub fn commit(&mut self, weights: Weights) {
        self.published = Some(weights);
    }

    pub fn previous(&self) -> Option<&Weights> {
        self.published.as_ref()
    }
}
