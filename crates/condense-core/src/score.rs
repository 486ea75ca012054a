//! Per-task score records and normalized incentive weights.

use crate::miner::MinerId;
use crate::task::TaskId;
use crate::tier::TierId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Tolerance on the sum of a normalized weight vector.
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// How the dispatch of a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Fulfilled,
    TimedOut,
    Rejected,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Fulfilled => "fulfilled",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unit_interval(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// `max(0, 1 - elapsed / budget)`; exactly 0 at or past the deadline.
pub fn latency_score(elapsed: Duration, budget: Duration) -> f64 {
    if budget.is_zero() {
        return 0.0;
    }
    unit_interval(1.0 - elapsed.as_secs_f64() / budget.as_secs_f64())
}

/// Outcome of scoring one task for one miner. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub miner: MinerId,
    pub tier: TierId,
    pub task: TaskId,
    pub fidelity: f64,
    pub latency: f64,
    pub outcome: OutcomeKind,
    pub timestamp: DateTime<Utc>,
}

impl ScoreRecord {
    /// Scores are clamped into [0, 1]; NaN becomes 0.
    pub fn new(
        miner: MinerId,
        tier: TierId,
        task: TaskId,
        fidelity: f64,
        latency: f64,
        outcome: OutcomeKind,
    ) -> Self {
        Self {
            miner,
            tier,
            task,
            fidelity: unit_interval(fidelity),
            latency: unit_interval(latency),
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn zero(miner: MinerId, tier: TierId, task: TaskId, outcome: OutcomeKind) -> Self {
        Self::new(miner, tier, task, 0.0, 0.0, outcome)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The quantity the aggregator averages.
    pub fn combined(&self) -> f64 {
        self.fidelity * self.latency
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncentiveWeight {
    pub miner: MinerId,
    pub weight: f64,
}

/// Per-miner weights that sum to 1. Ordered by miner key so output is stable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weights(BTreeMap<MinerId, f64>);

impl Weights {
    /// Clip negative and non-finite scores to 0, then scale to sum 1.
    /// Returns `None` when nothing positive remains.
    pub fn normalize<I>(scores: I) -> Option<Self>
    where
        I: IntoIterator<Item = (MinerId, f64)>,
    {
        let clipped: BTreeMap<MinerId, f64> = scores
            .into_iter()
            .map(|(m, s)| (m, if s.is_finite() && s > 0.0 { s } else { 0.0 }))
            .collect();
        let total: f64 = clipped.values().sum();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        Some(Self(
            clipped.into_iter().map(|(m, s)| (m, s / total)).collect(),
        ))
    }

    /// Equal share for every given miner.
    pub fn uniform<I>(miners: I) -> Option<Self>
    where
        I: IntoIterator<Item = MinerId>,
    {
        Self::normalize(miners.into_iter().map(|m| (m, 1.0)))
    }

    pub fn get(&self, miner: &MinerId) -> f64 {
        self.0.get(miner).copied().unwrap_or(0.0)
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= WEIGHT_SUM_EPSILON
    }

    pub fn renormalized(&self) -> Option<Self> {
        Self::normalize(self.0.iter().map(|(m, w)| (m.clone(), *w)))
    }

    pub fn miners(&self) -> impl Iterator<Item = &MinerId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MinerId, f64)> {
        self.0.iter().map(|(m, w)| (m, *w))
    }

    pub fn to_vec(&self) -> Vec<IncentiveWeight> {
        self.0
            .iter()
            .map(|(m, w)| IncentiveWeight {
                miner: m.clone(),
                weight: *w,
            })
            .collect()
    }

    /// Only the given miners, rescaled to sum 1. `None` when none of them
    /// holds a positive weight.
    pub fn restricted_to(&self, miners: &[MinerId]) -> Option<Self> {
        Self::normalize(
            self.0
                .iter()
                .filter(|(m, _)| miners.contains(m))
                .map(|(m, w)| (m.clone(), *w)),
        )
    }

    /// Exponential smoothing: `alpha * self + (1 - alpha) * previous` over the
    /// union of miners, renormalized.
    pub fn blend(&self, previous: &Weights, alpha: f64) -> Weights {
        let alpha = unit_interval(alpha);
        let mut mixed: BTreeMap<MinerId, f64> = BTreeMap::new();
        for (m, w) in &self.0 {
            *mixed.entry(m.clone()).or_insert(0.0) += alpha * w;
        }
        for (m, w) in &previous.0 {
            *mixed.entry(m.clone()).or_insert(0.0) += (1.0 - alpha) * w;
        }
        Self::normalize(mixed).unwrap_or_else(|| self.clone())
    }

    /// Scale to integer shares of `u16::MAX`, the form ledgers usually accept.
    pub fn quantize_u16(&self) -> Vec<(MinerId, u16)> {
        self.0
            .iter()
            .map(|(m, w)| {
                let q = (unit_interval(*w) * u16::MAX as f64).round() as u16;
                (m.clone(), q)
            })
            .collect()
    }
}

impl FromIterator<(MinerId, f64)> for Weights {
    /// Collects raw values without normalizing.
    fn from_iter<T: IntoIterator<Item = (MinerId, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> MinerId {
        MinerId::from(s)
    }

    #[test]
    fn test_latency_score() {
        let budget = Duration::from_secs(2);
        assert!((latency_score(Duration::from_millis(500), budget) - 0.75).abs() < 1e-12);
        assert_eq!(latency_score(Duration::ZERO, budget), 1.0);
        assert_eq!(latency_score(budget, budget), 0.0);
        assert_eq!(latency_score(Duration::from_millis(2100), budget), 0.0);
        assert_eq!(latency_score(Duration::from_millis(1), Duration::ZERO), 0.0);
    }

    #[test]
    fn test_record_clamps_scores() {
        let r = ScoreRecord::new(
            m("a"),
            TierId::from("t"),
            TaskId::fingerprint(
                &TierId::from("t"),
                "c",
                &crate::task::Probe::new(crate::task::ProbeKind::FactLookup, "p"),
            ),
            1.4,
            f64::NAN,
            OutcomeKind::Fulfilled,
        );
        assert_eq!(r.fidelity, 1.0);
        assert_eq!(r.latency, 0.0);
        assert_eq!(r.combined(), 0.0);
    }

    #[test]
    fn test_normalize_clips_negative_and_nan() {
        let w = Weights::normalize(vec![
            (m("a"), 3.0),
            (m("b"), -1.0),
            (m("c"), f64::NAN),
            (m("d"), 1.0),
        ])
        .unwrap();
        assert!(w.is_normalized());
        assert_eq!(w.get(&m("a")), 0.75);
        assert_eq!(w.get(&m("b")), 0.0);
        assert_eq!(w.get(&m("c")), 0.0);
        assert_eq!(w.get(&m("d")), 0.25);
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_normalize_all_zero_is_none() {
        assert!(Weights::normalize(vec![(m("a"), 0.0), (m("b"), -2.0)]).is_none());
        assert!(Weights::normalize(Vec::new()).is_none());
    }

    #[test]
    fn test_blend_keeps_sum() {
        let prev = Weights::normalize(vec![(m("a"), 1.0)]).unwrap();
        let new = Weights::normalize(vec![(m("b"), 1.0)]).unwrap();
        let blended = new.blend(&prev, 0.2);
        assert!(blended.is_normalized());
        assert!((blended.get(&m("a")) - 0.8).abs() < 1e-12);
        assert!((blended.get(&m("b")) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_blend_alpha_one_ignores_previous() {
        let prev = Weights::normalize(vec![(m("a"), 1.0)]).unwrap();
        let new = Weights::normalize(vec![(m("b"), 1.0)]).unwrap();
        let blended = new.blend(&prev, 1.0);
        assert_eq!(blended.get(&m("b")), 1.0);
        assert_eq!(blended.get(&m("a")), 0.0);
    }

    #[test]
    fn test_restricted_to_renormalizes_survivors() {
        let w = Weights::normalize(vec![(m("a"), 2.0), (m("b"), 1.0), (m("c"), 1.0)]).unwrap();
        let kept = w.restricted_to(&[m("b"), m("c"), m("new")]).unwrap();
        assert_eq!(kept.len(), 2);
        assert!((kept.get(&m("b")) - 0.5).abs() < 1e-12);
        assert!(kept.is_normalized());
        assert!(w.restricted_to(&[m("new")]).is_none());
    }

    #[test]
    fn test_uniform() {
        let w = Weights::uniform(vec![m("a"), m("b")]).unwrap();
        assert_eq!(w.get(&m("a")), 0.5);
        assert!(Weights::uniform(Vec::new()).is_none());
    }

    #[test]
    fn test_quantize_u16() {
        let w = Weights::normalize(vec![(m("a"), 1.0), (m("b"), 1.0)]).unwrap();
        let q = w.quantize_u16();
        assert_eq!(q, vec![(m("a"), 32768), (m("b"), 32768)]);
    }

    #[test]
    fn test_serde_is_a_plain_map() {
        let w = Weights::normalize(vec![(m("a"), 1.0)]).unwrap();
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"a":1.0}"#);
    }
}
