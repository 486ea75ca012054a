//! Tier registry with atomic snapshot swap.
//!
//! Rounds read one immutable [`TierTable`] snapshot for their whole duration.
//! A reload validates the replacement table first and swaps it in with a
//! single pointer store, so readers see either the old table or the new one.

use arc_swap::ArcSwapOption;
use condense_core::{MinerInfo, Tier, TierError, TierId, TierTable};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("tier registry unavailable: no tier table loaded")]
    Unavailable,

    #[error(transparent)]
    Tier(#[from] TierError),
}

/// Changes applied by a reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadReport {
    pub added: Vec<TierId>,
    pub removed: Vec<TierId>,
    pub changed: Vec<TierId>,
    pub generation: u64,
}

impl ReloadReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub struct TierRegistry {
    table: ArcSwapOption<TierTable>,
    generation: AtomicU64,
}

impl TierRegistry {
    pub fn new(table: TierTable) -> Self {
        Self {
            table: ArcSwapOption::from_pointee(table),
            generation: AtomicU64::new(1),
        }
    }

    /// A registry with no table; every lookup fails until [`reload`](Self::reload).
    pub fn empty() -> Self {
        Self {
            table: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_tiers(tiers: Vec<Tier>) -> Result<Self, RegistryError> {
        Ok(Self::new(TierTable::new(tiers)?))
    }

    pub fn snapshot(&self) -> Result<Arc<TierTable>, RegistryError> {
        self.table.load_full().ok_or(RegistryError::Unavailable)
    }

    pub fn get(&self, id: &TierId) -> Result<Tier, RegistryError> {
        let table = self.snapshot()?;
        Ok(table.get(id)?.clone())
    }

    pub fn list_eligible(&self, miner: &MinerInfo) -> Result<Vec<Tier>, RegistryError> {
        let table = self.snapshot()?;
        Ok(table.eligible_for(miner).cloned().collect())
    }

    /// Number of tables installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Validate `tiers` and swap them in. An invalid table leaves the current
    /// snapshot in place.
    pub fn reload(&self, tiers: Vec<Tier>) -> Result<ReloadReport, RegistryError> {
        let next = match TierTable::new(tiers) {
            Ok(table) => table,
            Err(e) => {
                warn!("Refusing tier table reload: {}", e);
                return Err(e.into());
            }
        };

        let mut report = ReloadReport::default();
        let current = self.table.load_full();
        match current.as_deref() {
            Some(old) => {
                for tier in next.iter() {
                    match old.get(&tier.id) {
                        Ok(prev) if prev == tier => {}
                        Ok(_) => report.changed.push(tier.id.clone()),
                        Err(_) => report.added.push(tier.id.clone()),
                    }
                }
                report.removed = old.ids().filter(|id| !next.contains(id)).cloned().collect();
            }
            None => report.added = next.ids().cloned().collect(),
        }

        self.table.store(Some(Arc::new(next)));
        report.generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if !report.is_noop() {
            info!(
                "Tier table reloaded (generation {}): added={:?} removed={:?} changed={:?}",
                report.generation, report.added, report.removed, report.changed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use condense_core::Eligibility;
    use std::time::Duration;

    fn tier(id: &str, budget_ms: u64) -> Tier {
        Tier::new(
            id,
            (256, 1536),
            64,
            "mistral-7b",
            Duration::from_millis(budget_ms),
        )
    }

    #[test]
    fn test_empty_registry_is_unavailable() {
        let reg = TierRegistry::empty();
        assert_eq!(reg.snapshot().unwrap_err(), RegistryError::Unavailable);
        assert_eq!(
            reg.get(&TierId::from("inference_0")).unwrap_err(),
            RegistryError::Unavailable
        );
    }

    #[test]
    fn test_get_unknown_tier() {
        let reg = TierRegistry::from_tiers(vec![tier("inference_0", 2000)]).unwrap();
        assert_eq!(
            reg.get(&TierId::from("research")).unwrap_err(),
            RegistryError::Tier(TierError::UnknownTier(TierId::from("research")))
        );
    }

    #[test]
    fn test_list_eligible() {
        let reg = TierRegistry::from_tiers(vec![
            tier("inference_0", 2000),
            tier("inference_1", 8000).with_eligibility(Eligibility::DeclaredTier),
        ])
        .unwrap();
        let miner = MinerInfo::new("m1", "http://m1");
        let tiers = reg.list_eligible(&miner).unwrap();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].id, TierId::from("inference_0"));
    }

    #[test]
    fn test_reload_reports_changes() {
        let reg = TierRegistry::from_tiers(vec![tier("inference_0", 2000), tier("old", 2000)])
            .unwrap();
        let report = reg
            .reload(vec![tier("inference_0", 3000), tier("inference_1", 8000)])
            .unwrap();
        assert_eq!(report.changed, vec![TierId::from("inference_0")]);
        assert_eq!(report.added, vec![TierId::from("inference_1")]);
        assert_eq!(report.removed, vec![TierId::from("old")]);
        assert_eq!(report.generation, 2);
        assert_eq!(
            reg.get(&TierId::from("inference_0"))
                .unwrap()
                .latency_budget(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_invalid_reload_keeps_old_table() {
        let reg = TierRegistry::from_tiers(vec![tier("inference_0", 2000)]).unwrap();
        let err = reg.reload(vec![tier("inference_0", 0)]).unwrap_err();
        assert!(matches!(err, RegistryError::Tier(TierError::Invalid { .. })));
        assert_eq!(reg.generation(), 1);
        assert!(reg.get(&TierId::from("inference_0")).is_ok());
    }

    #[test]
    fn test_snapshot_is_stable_across_reload() {
        let reg = TierRegistry::from_tiers(vec![tier("inference_0", 2000)]).unwrap();
        let before = reg.snapshot().unwrap();
        reg.reload(vec![tier("inference_1", 2000)]).unwrap();
        assert!(before.contains(&TierId::from("inference_0")));
        assert!(!reg.snapshot().unwrap().contains(&TierId::from("inference_0")));
    }

    #[test]
    fn test_reload_into_empty_registry() {
        let reg = TierRegistry::empty();
        let report = reg.reload(vec![tier("inference_0", 2000)]).unwrap();
        assert_eq!(report.added, vec![TierId::from("inference_0")]);
        assert_eq!(report.generation, 1);
    }
}
