//! Convergence algorithm: move the portfolio toward its target weights.
//!
//! A cycle works from one valuation snapshot:
//! 1. every target gets `target = total * weight / 10000` (truncated)
//! 2. over-allocated targets are withdrawn first, in registry order
//! 3. under-allocated targets are then funded from the buffer, in registry
//!    order, until the buffer runs dry
//!
//! Adapter faults are absorbed into the report. A short withdrawal or a
//! rejected allocation only means the target stays off-weight until a later
//! cycle; the buffer is credited or debited with exactly what moved.

use super::registry::Target;
use super::valuation::ValuationSnapshot;
use super::Ledger;
use crate::adapter::Amount;
use crate::utils::decimal::bps_of;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Planned position of one target within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMove {
    pub id: String,
    pub weight_bps: u32,
    /// `None` when the valuation read failed; such targets are not moved
    pub current_value: Option<Amount>,
    pub target_value: Amount,
}

impl PlannedMove {
    /// Amount above target (withdrawal candidate).
    pub fn surplus(&self) -> Amount {
        self.current_value
            .map_or(0, |current| current.saturating_sub(self.target_value))
    }

    /// Amount below target (allocation candidate).
    pub fn deficit(&self) -> Amount {
        self.current_value
            .map_or(0, |current| self.target_value.saturating_sub(current))
    }

    /// `target - current`, saturating at the i128 range.
    pub fn delta(&self) -> i128 {
        let current = self.current_value.unwrap_or(0);
        let target = i128::try_from(self.target_value).unwrap_or(i128::MAX);
        let current = i128::try_from(current).unwrap_or(i128::MAX);
        target.saturating_sub(current)
    }
}

/// Per-cycle plan, recomputed from scratch on every rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub total_value: Amount,
    pub buffer: Amount,
    /// Active targets in registry order
    pub moves: Vec<PlannedMove>,
}

impl RebalancePlan {
    pub fn compute(snapshot: &ValuationSnapshot) -> Self {
        let moves = snapshot
            .targets
            .iter()
            .map(|t| PlannedMove {
                id: t.id.clone(),
                weight_bps: t.weight_bps,
                current_value: t.value,
                target_value: bps_of(snapshot.total_value, t.weight_bps),
            })
            .collect();

        Self {
            total_value: snapshot.total_value,
            buffer: snapshot.buffer,
            moves,
        }
    }

    pub fn withdrawals(&self) -> impl Iterator<Item = &PlannedMove> {
        self.moves.iter().filter(|m| m.surplus() > 0)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &PlannedMove> {
        self.moves.iter().filter(|m| m.deficit() > 0)
    }
}

/// What happened to one target during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MoveAction {
    /// Already on target
    Hold,
    /// Valuation unreadable; left alone this cycle
    SkippedUnreadable,
    Withdrew { requested: Amount, actual: Amount },
    WithdrawFailed { requested: Amount, error: String },
    Allocated { amount: Amount },
    AllocationRejected { amount: Amount },
    AllocationFailed { amount: Amount, error: String },
    /// Under target but the buffer was already empty
    NoLiquidity { wanted: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub id: String,
    pub current_value: Option<Amount>,
    pub target_value: Amount,
    pub action: MoveAction,
}

/// Whether the cycle moved anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceOutcome {
    Executed,
    /// Total value was zero; nothing to distribute
    EmptyPortfolio,
}

/// Result of one rebalance cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub timestamp: DateTime<Utc>,
    pub outcome: RebalanceOutcome,
    pub total_value: Amount,
    pub buffer_before: Amount,
    pub buffer_after: Amount,
    pub outcomes: Vec<TargetOutcome>,
}

impl RebalanceReport {
    pub fn empty(timestamp: DateTime<Utc>, buffer: Amount) -> Self {
        Self {
            timestamp,
            outcome: RebalanceOutcome::EmptyPortfolio,
            total_value: 0,
            buffer_before: buffer,
            buffer_after: buffer,
            outcomes: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn total_withdrawn(&self) -> Amount {
        self.outcomes
            .iter()
            .map(|o| match o.action {
                MoveAction::Withdrew { actual, .. } => actual,
                _ => 0,
            })
            .sum()
    }

    pub fn total_allocated(&self) -> Amount {
        self.outcomes
            .iter()
            .map(|o| match o.action {
                MoveAction::Allocated { amount } => amount,
                _ => 0,
            })
            .sum()
    }

    /// Withdrawals that returned less than requested, or failed.
    pub fn shortfalls(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| match o.action {
                MoveAction::Withdrew { requested, actual } => actual < requested,
                MoveAction::WithdrawFailed { .. } => true,
                _ => false,
            })
            .count()
    }

    /// Allocations that were rejected or failed.
    pub fn rejections(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.action,
                    MoveAction::AllocationRejected { .. } | MoveAction::AllocationFailed { .. }
                )
            })
            .count()
    }
}

/// Executes a plan against the adapters.
pub struct RebalanceEngine;

impl RebalanceEngine {
    /// Run the withdrawal pass, then the allocation pass.
    ///
    /// `targets` must be the registry slice the plan was computed from. The
    /// ledger's buffer is updated after every adapter call so an observer never
    /// sees value in two places at once for longer than a single call.
    pub async fn execute(
        plan: &RebalancePlan,
        targets: &[Target],
        ledger: &RwLock<Ledger>,
        timestamp: DateTime<Utc>,
    ) -> RebalanceReport {
        let buffer_before = ledger.read().await.buffer;
        let mut actions: Vec<Option<MoveAction>> = vec![None; plan.moves.len()];

        // Withdrawal pass
        for (index, planned) in plan.moves.iter().enumerate() {
            let surplus = planned.surplus();
            if surplus == 0 {
                continue;
            }
            let Some(target) = targets.iter().find(|t| t.id == planned.id) else {
                continue;
            };
            let current = planned.current_value.unwrap_or(0);
            let requested = surplus.min(current);

            let action = match target.adapter.withdraw(requested).await {
                Ok(returned) => {
                    let actual = clamp_returned(&planned.id, requested, returned);
                    {
                        let mut ledger = ledger.write().await;
                        ledger.buffer = ledger.buffer.saturating_add(actual);
                    }
                    if actual < requested {
                        warn!(
                            target_id = %planned.id,
                            %requested,
                            %actual,
                            "Partial withdrawal, target stays over weight"
                        );
                    }
                    MoveAction::Withdrew { requested, actual }
                }
                Err(e) => {
                    warn!(target_id = %planned.id, %requested, error = %e, "Withdrawal failed");
                    MoveAction::WithdrawFailed {
                        requested,
                        error: e.to_string(),
                    }
                }
            };
            actions[index] = Some(action);
        }

        // Allocation pass
        for (index, planned) in plan.moves.iter().enumerate() {
            let wanted = planned.deficit();
            if wanted == 0 {
                continue;
            }
            let Some(target) = targets.iter().find(|t| t.id == planned.id) else {
                continue;
            };
            let available = wanted.min(ledger.read().await.buffer);
            if available == 0 {
                debug!(target_id = %planned.id, %wanted, "Buffer exhausted, skipping allocation");
                actions[index] = Some(MoveAction::NoLiquidity { wanted });
                continue;
            }

            let action = match target.adapter.allocate(available).await {
                Ok(true) => {
                    let mut ledger = ledger.write().await;
                    ledger.buffer = ledger.buffer.saturating_sub(available);
                    MoveAction::Allocated { amount: available }
                }
                Ok(false) => {
                    warn!(target_id = %planned.id, amount = %available, "Allocation rejected, funds stay in buffer");
                    MoveAction::AllocationRejected { amount: available }
                }
                Err(e) => {
                    warn!(target_id = %planned.id, amount = %available, error = %e, "Allocation failed, funds stay in buffer");
                    MoveAction::AllocationFailed {
                        amount: available,
                        error: e.to_string(),
                    }
                }
            };
            actions[index] = Some(action);
        }

        let outcomes = plan
            .moves
            .iter()
            .zip(actions)
            .map(|(planned, action)| TargetOutcome {
                id: planned.id.clone(),
                current_value: planned.current_value,
                target_value: planned.target_value,
                action: action.unwrap_or(if planned.current_value.is_some() {
                    MoveAction::Hold
                } else {
                    MoveAction::SkippedUnreadable
                }),
            })
            .collect();

        let report = RebalanceReport {
            timestamp,
            outcome: RebalanceOutcome::Executed,
            total_value: plan.total_value,
            buffer_before,
            buffer_after: ledger.read().await.buffer,
            outcomes,
        };

        info!(
            total_value = %report.total_value,
            withdrawn = %report.total_withdrawn(),
            allocated = %report.total_allocated(),
            buffer_after = %report.buffer_after,
            shortfalls = report.shortfalls(),
            rejections = report.rejections(),
            "Rebalance cycle complete"
        );

        report
    }
}

/// Never credit more than was asked for.
fn clamp_returned(id: &str, requested: Amount, returned: Amount) -> Amount {
    if returned > requested {
        warn!(
            target_id = %id,
            %requested,
            %returned,
            "Adapter reported more than requested, crediting the requested amount"
        );
        return requested;
    }
    returned
}
