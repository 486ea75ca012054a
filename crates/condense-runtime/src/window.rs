//! Rolling score windows
//!
//! Each (miner, tier) pair keeps its most recent score records, bounded by
//! count and optionally by age. The aggregator reads these windows; nothing
//! else mutates them.

use chrono::{DateTime, Duration, Utc};
use condense_core::{MinerId, ScoreRecord, TierId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowPolicy {
    /// Records kept per (miner, tier)
    pub max_records: usize,
    /// Drop records older than this many seconds
    pub max_age_secs: Option<u64>,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            max_records: 32,
            max_age_secs: None,
        }
    }
}

impl WindowPolicy {
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age_secs
            .map(|secs| now - Duration::seconds(secs.min(i64::MAX as u64) as i64))
    }
}

/// Count- and age-bounded window of score records
#[derive(Debug, Clone, Default)]
pub struct ScoreWindow {
    records: VecDeque<ScoreRecord>,
}

impl ScoreWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ScoreRecord, policy: &WindowPolicy, now: DateTime<Utc>) {
        self.records.push_back(record);
        while self.records.len() > policy.max_records.max(1) {
            self.records.pop_front();
        }
        self.evict(policy, now);
    }

    /// Remove records past the policy's age bound.
    pub fn evict(&mut self, policy: &WindowPolicy, now: DateTime<Utc>) {
        if let Some(cutoff) = policy.cutoff(now) {
            while let Some(front) = self.records.front() {
                if front.timestamp < cutoff {
                    self.records.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ScoreRecord> {
        self.records.iter()
    }

    pub fn combined_scores(&self) -> Vec<f64> {
        self.records.iter().map(ScoreRecord::combined).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Windows for every (miner, tier) pair seen so far
#[derive(Debug, Clone, Default)]
pub struct WindowSet {
    policy: WindowPolicy,
    windows: FxHashMap<(MinerId, TierId), ScoreWindow>,
}

impl WindowSet {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            windows: FxHashMap::default(),
        }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    pub fn append(&mut self, record: ScoreRecord, now: DateTime<Utc>) {
        let key = (record.miner.clone(), record.tier.clone());
        self.windows
            .entry(key)
            .or_default()
            .push(record, &self.policy, now);
    }

    /// Apply the age bound to every window and drop the empty ones.
    pub fn evict(&mut self, now: DateTime<Utc>) {
        let policy = &self.policy;
        self.windows.retain(|_, w| {
            w.evict(policy, now);
            !w.is_empty()
        });
    }

    pub fn get(&self, miner: &MinerId, tier: &TierId) -> Option<&ScoreWindow> {
        self.windows.get(&(miner.clone(), tier.clone()))
    }

    /// Miners with at least one record.
    pub fn miners(&self) -> Vec<MinerId> {
        let mut miners: Vec<MinerId> = self.windows.keys().map(|(m, _)| m.clone()).collect();
        miners.sort();
        miners.dedup();
        miners
    }

    /// All records, oldest first within each window.
    pub fn checkpoint(&self) -> Vec<ScoreRecord> {
        let mut records: Vec<ScoreRecord> = self
            .windows
            .values()
            .flat_map(|w| w.records().cloned())
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records
    }

    pub fn restore(&mut self, records: Vec<ScoreRecord>, now: DateTime<Utc>) {
        self.windows.clear();
        for record in records {
            self.append(record, now);
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
