//! Registry of allocation targets and their weights.
//!
//! The registry is pure bookkeeping: it never calls an adapter. Every mutation
//! is validated before anything changes, so a rejected call leaves the
//! registry untouched and `total_weight_bps() <= 10000` always holds.

use crate::adapter::{Amount, StrategyAdapter};
use crate::error::{PortfolioError, PortfolioResult};
use crate::utils::decimal::BPS_DENOMINATOR;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One active allocation slot.
#[derive(Clone)]
pub struct Target {
    /// Stable identifier, unique among active targets
    pub id: String,
    /// Backend holding this slot's capital
    pub adapter: Arc<dyn StrategyAdapter>,
    /// Target share of total value in bps, never 0 while active
    pub weight_bps: u32,
    pub added_at: DateTime<Utc>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("weight_bps", &self.weight_bps)
            .field("added_at", &self.added_at)
            .finish_non_exhaustive()
    }
}

/// Audit record of a removed target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredTarget {
    pub id: String,
    pub weight_bps: u32,
    pub added_at: DateTime<Utc>,
    pub removed_at: DateTime<Utc>,
    /// Amount returned to the buffer by the removal drain
    pub drained: Amount,
    /// Last known value left behind with the backend (illiquid or unreadable)
    pub residual: Amount,
}

/// Ordered set of active targets plus the history of removed ones.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    targets: Vec<Target>,
    retired: Vec<RetiredTarget>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active targets in insertion order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn retired(&self) -> &[RetiredTarget] {
        &self.retired
    }

    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Sum of active weights.
    pub fn total_weight_bps(&self) -> u32 {
        self.targets.iter().map(|t| t.weight_bps).sum()
    }

    /// Append a new target.
    ///
    /// Fails with `InvalidAddress` for an empty id, `InvalidWeight` for a zero
    /// or out-of-range weight, `DuplicateTarget` if the id is already active,
    /// and `WeightExceeded` if the sum would pass 10000 bps.
    pub fn add_target(
        &mut self,
        id: &str,
        adapter: Arc<dyn StrategyAdapter>,
        weight_bps: u32,
        now: DateTime<Utc>,
    ) -> PortfolioResult<()> {
        if id.trim().is_empty() {
            return Err(PortfolioError::InvalidAddress);
        }
        validate_weight(weight_bps)?;
        if self.get(id).is_some() {
            return Err(PortfolioError::DuplicateTarget { id: id.to_string() });
        }
        let current_total_bps = self.total_weight_bps();
        check_sum(current_total_bps, current_total_bps + weight_bps)?;

        self.targets.push(Target {
            id: id.to_string(),
            adapter,
            weight_bps,
            added_at: now,
        });
        Ok(())
    }

    /// Replace a target's weight. Returns the previous weight.
    pub fn update_weight(&mut self, id: &str, weight_bps: u32) -> PortfolioResult<u32> {
        let current_total_bps = self.total_weight_bps();
        let index = self.index_of(id)?;
        validate_weight(weight_bps)?;

        let old_weight = self.targets[index].weight_bps;
        check_sum(current_total_bps, current_total_bps - old_weight + weight_bps)?;

        self.targets[index].weight_bps = weight_bps;
        Ok(old_weight)
    }

    /// Delete an active slot and keep an audit record of it.
    ///
    /// Callers drain the adapter first; `drained` and `residual` record how
    /// that went.
    pub fn retire(
        &mut self,
        id: &str,
        drained: Amount,
        residual: Amount,
        now: DateTime<Utc>,
    ) -> PortfolioResult<RetiredTarget> {
        let index = self.index_of(id)?;
        let target = self.targets.remove(index);

        let record = RetiredTarget {
            id: target.id,
            weight_bps: target.weight_bps,
            added_at: target.added_at,
            removed_at: now,
            drained,
            residual,
        };
        self.retired.push(record.clone());
        Ok(record)
    }

    fn index_of(&self, id: &str) -> PortfolioResult<usize> {
        self.targets
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| PortfolioError::NotFound { id: id.to_string() })
    }
}

fn validate_weight(weight_bps: u32) -> PortfolioResult<()> {
    if weight_bps == 0 || weight_bps > BPS_DENOMINATOR {
        return Err(PortfolioError::InvalidWeight { weight_bps });
    }
    Ok(())
}

fn check_sum(current_total_bps: u32, resulting_bps: u32) -> PortfolioResult<()> {
    if resulting_bps > BPS_DENOMINATOR {
        return Err(PortfolioError::WeightExceeded {
            current_total_bps,
            resulting_bps,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PaperStrategy;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn adapter() -> Arc<dyn StrategyAdapter> {
        Arc::new(PaperStrategy::new())
    }

    fn registry_with(weights: &[(&str, u32)]) -> AllocationRegistry {
        let mut registry = AllocationRegistry::new();
        for (id, weight) in weights {
            registry.add_target(id, adapter(), *weight, Utc::now()).unwrap();
        }
        registry
    }

    fn ids(registry: &AllocationRegistry) -> Vec<&str> {
        registry.targets().iter().map(|t| t.id.as_str()).collect()
    }

    // =========================================================================
    // Add Tests
    // =========================================================================

    #[test]
    fn test_add_preserves_insertion_order() {
        let registry = registry_with(&[("b", 1_000), ("a", 2_000), ("c", 3_000)]);

        assert_eq!(ids(&registry), vec!["b", "a", "c"]);
        assert_eq!(registry.total_weight_bps(), 6_000);
    }

    #[test]
    fn test_add_rejects_empty_id() {
        let mut registry = AllocationRegistry::new();
        let err = registry.add_target("  ", adapter(), 100, Utc::now()).unwrap_err();
        assert_eq!(err, PortfolioError::InvalidAddress);
    }

    #[test]
    fn test_add_rejects_zero_and_oversized_weight() {
        let mut registry = AllocationRegistry::new();

        let err = registry.add_target("a", adapter(), 0, Utc::now()).unwrap_err();
        assert_eq!(err, PortfolioError::InvalidWeight { weight_bps: 0 });

        let err = registry.add_target("a", adapter(), 10_001, Utc::now()).unwrap_err();
        assert_eq!(err, PortfolioError::InvalidWeight { weight_bps: 10_001 });
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let mut registry = registry_with(&[("a", 1_000)]);
        let err = registry.add_target("a", adapter(), 1_000, Utc::now()).unwrap_err();

        assert_eq!(err, PortfolioError::DuplicateTarget { id: "a".to_string() });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_rejects_weight_overflow_and_leaves_state() {
        let mut registry = registry_with(&[("a", 6_000), ("b", 4_000)]);
        let err = registry.add_target("c", adapter(), 5_000, Utc::now()).unwrap_err();

        assert_eq!(
            err,
            PortfolioError::WeightExceeded {
                current_total_bps: 10_000,
                resulting_bps: 15_000,
            }
        );
        assert_eq!(ids(&registry), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().weight_bps, 6_000);
        assert_eq!(registry.get("b").unwrap().weight_bps, 4_000);
    }

    #[test]
    fn test_exact_full_weight_is_allowed() {
        let registry = registry_with(&[("a", 6_000), ("b", 4_000)]);
        assert_eq!(registry.total_weight_bps(), 10_000);
    }

    // =========================================================================
    // Update Tests
    // =========================================================================

    #[test]
    fn test_update_weight_substitutes_old_weight() {
        let mut registry = registry_with(&[("a", 6_000), ("b", 4_000)]);

        assert_eq!(registry.update_weight("a", 3_000).unwrap(), 6_000);
        assert_eq!(registry.update_weight("b", 7_000).unwrap(), 4_000);
        assert_eq!(registry.total_weight_bps(), 10_000);
    }

    #[test]
    fn test_update_weight_rejections() {
        let mut registry = registry_with(&[("a", 6_000), ("b", 4_000)]);

        assert_eq!(
            registry.update_weight("x", 100).unwrap_err(),
            PortfolioError::NotFound { id: "x".to_string() }
        );
        assert_eq!(
            registry.update_weight("a", 0).unwrap_err(),
            PortfolioError::InvalidWeight { weight_bps: 0 }
        );
        assert_eq!(
            registry.update_weight("a", 6_001).unwrap_err(),
            PortfolioError::WeightExceeded {
                current_total_bps: 10_000,
                resulting_bps: 10_001,
            }
        );
        assert_eq!(registry.get("a").unwrap().weight_bps, 6_000);
    }

    // =========================================================================
    // Retire Tests
    // =========================================================================

    #[test]
    fn test_retire_frees_weight_and_keeps_history() {
        let mut registry = registry_with(&[("a", 6_000), ("b", 4_000)]);

        let record = registry.retire("a", 900, 100, Utc::now()).unwrap();
        assert_eq!(record.drained, 900);
        assert_eq!(record.residual, 100);
        assert_eq!(ids(&registry), vec!["b"]);
        assert_eq!(registry.total_weight_bps(), 4_000);
        assert_eq!(registry.retired().len(), 1);

        // The id can be registered again once retired.
        registry.add_target("a", adapter(), 6_000, Utc::now()).unwrap();
        assert_eq!(ids(&registry), vec!["b", "a"]);
    }

    #[test]
    fn test_retire_unknown_target() {
        let mut registry = AllocationRegistry::new();
        assert!(matches!(
            registry.retire("a", 0, 0, Utc::now()),
            Err(PortfolioError::NotFound { .. })
        ));
    }

    #[test]
    fn test_weight_invariant_over_operation_sequence() {
        let mut registry = AllocationRegistry::new();
        let ops: Vec<(&str, u32)> = vec![
            ("a", 3_000),
            ("b", 5_000),
            ("c", 3_000),
            ("a", 5_000),
            ("c", 2_000),
            ("d", 1),
        ];
        for (id, weight) in ops {
            if registry.get(id).is_some() {
                let _ = registry.update_weight(id, weight);
            } else {
                let _ = registry.add_target(id, adapter(), weight, Utc::now());
            }
            assert!(registry.total_weight_bps() <= BPS_DENOMINATOR);
        }
        let _ = registry.retire("b", 0, 0, Utc::now());
        assert!(registry.total_weight_bps() <= BPS_DENOMINATOR);
    }
}
