//! Weighted multi-strategy portfolio.
//!
//! Contains the control plane that keeps pooled capital spread across
//! strategy backends according to administrator-defined weights:
//! - Target registry with the `sum(weights) <= 10000 bps` invariant
//! - Valuation across heterogeneous backends
//! - Interval and drift gating
//! - Withdraw-then-allocate convergence with partial-fill tolerance
//! - A non-reentrant guard around every capital-moving operation
//!
//! Lock discipline: the async locks below are only ever held between adapter
//! calls, never across one. Adapters may therefore call read-only methods
//! while a rebalance runs, and any mutating call they attempt is rejected by
//! the guard with `Reentrant`.

mod access;
mod engine;
mod events;
mod gate;
mod guard;
mod registry;
mod valuation;

pub use access::AccessControl;
pub use engine::{
    MoveAction, PlannedMove, RebalanceEngine, RebalanceOutcome, RebalancePlan, RebalanceReport,
    TargetOutcome,
};
pub use events::{EventLog, EventRecord, PortfolioEvent};
pub use gate::{
    DriftEntry, DriftReport, GateDecision, GateReason, RebalanceGate, MAX_REBALANCE_INTERVAL_SECS,
};
pub use guard::{ConcurrencyGuard, GuardToken};
pub use registry::{AllocationRegistry, RetiredTarget, Target};
pub use valuation::{TargetValuation, ValuationAggregator, ValuationSnapshot};

use crate::adapter::{Amount, StrategyAdapter};
use crate::config::RebalanceConfig;
use crate::error::{PortfolioError, PortfolioResult};
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Unallocated value and rebalance bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub buffer: Amount,
    pub last_rebalance_at: Option<DateTime<Utc>>,
}

/// Serializable view of one active target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    /// Position in registry order, starting at 0
    pub position: usize,
    pub id: String,
    pub weight_bps: u32,
    pub value: Option<Amount>,
    pub added_at: DateTime<Utc>,
}

/// Point-in-time view of the whole portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub taken_at: DateTime<Utc>,
    pub buffer: Amount,
    pub total_value: Amount,
    pub total_weight_bps: u32,
    pub rebalance_interval_secs: u64,
    pub rebalance_threshold_bps: u32,
    pub last_rebalance_at: Option<DateTime<Utc>>,
    pub targets: Vec<TargetSnapshot>,
    pub retired: Vec<RetiredTarget>,
}

/// The portfolio engine. One instance owns one pool of capital.
pub struct Portfolio {
    guard: ConcurrencyGuard,
    clock: Arc<dyn Clock>,
    access: RwLock<AccessControl>,
    registry: RwLock<AllocationRegistry>,
    gate: RwLock<RebalanceGate>,
    ledger: RwLock<Ledger>,
    events: EventLog,
}

impl Portfolio {
    /// Create an empty portfolio.
    pub fn new<I, S>(config: &RebalanceConfig, admins: I, clock: Arc<dyn Clock>) -> PortfolioResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let gate = RebalanceGate::new(config.interval_secs, config.threshold_bps)?;
        Ok(Self {
            guard: ConcurrencyGuard::new(),
            clock,
            access: RwLock::new(AccessControl::new(admins)),
            registry: RwLock::new(AllocationRegistry::new()),
            gate: RwLock::new(gate),
            ledger: RwLock::new(Ledger::default()),
            events: EventLog::new(),
        })
    }

    // =========================================================================
    // Registry administration
    // =========================================================================

    /// Register a new target at the end of the registry order.
    pub async fn add_target(
        &self,
        caller: &str,
        id: &str,
        adapter: Arc<dyn StrategyAdapter>,
        weight_bps: u32,
    ) -> PortfolioResult<()> {
        let _token = self.guard.enter("add_target")?;
        self.access.read().await.ensure_admin(caller)?;

        let now = self.clock.now();
        let total_weight_bps = {
            let mut registry = self.registry.write().await;
            registry.add_target(id, adapter, weight_bps, now)?;
            registry.total_weight_bps()
        };

        info!(target_id = %id, weight_bps, total_weight_bps, "Target added");
        self.events
            .record(
                now,
                PortfolioEvent::TargetAdded {
                    id: id.to_string(),
                    weight_bps,
                    total_weight_bps,
                },
            )
            .await;
        Ok(())
    }

    /// Change a target's weight. Capital moves on the next rebalance.
    pub async fn update_weight(&self, caller: &str, id: &str, weight_bps: u32) -> PortfolioResult<()> {
        let _token = self.guard.enter("update_weight")?;
        self.access.read().await.ensure_admin(caller)?;

        let (old_weight_bps, total_weight_bps) = {
            let mut registry = self.registry.write().await;
            let old = registry.update_weight(id, weight_bps)?;
            (old, registry.total_weight_bps())
        };

        info!(target_id = %id, old_weight_bps, new_weight_bps = weight_bps, "Target weight updated");
        self.events
            .record(
                self.clock.now(),
                PortfolioEvent::WeightUpdated {
                    id: id.to_string(),
                    old_weight_bps,
                    new_weight_bps: weight_bps,
                    total_weight_bps,
                },
            )
            .await;
        Ok(())
    }

    /// Drain a target into the buffer, then delete its slot.
    ///
    /// The drain tolerates partial withdrawal; whatever the backend keeps is
    /// recorded as the retired target's residual. A target whose valuation
    /// cannot be read is not removed (`ValuationUnavailable`).
    pub async fn remove_target(&self, caller: &str, id: &str) -> PortfolioResult<RetiredTarget> {
        let _token = self.guard.enter("remove_target")?;
        self.access.read().await.ensure_admin(caller)?;

        let target = self
            .registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PortfolioError::NotFound { id: id.to_string() })?;

        let value = ValuationAggregator::read(id, target.adapter.as_ref())
            .await
            .ok_or_else(|| PortfolioError::ValuationUnavailable { id: id.to_string() })?;
        let drained = if value == 0 {
            0
        } else {
            match target.adapter.withdraw(value).await {
                Ok(returned) => returned.min(value),
                Err(e) => {
                    warn!(target_id = %id, %value, error = %e, "Drain withdrawal failed");
                    0
                }
            }
        };
        let residual = value - drained;

        let now = self.clock.now();
        let (record, total_weight_bps) = {
            // Buffer credit and slot deletion land together.
            let mut ledger = self.ledger.write().await;
            let mut registry = self.registry.write().await;
            ledger.buffer = ledger.buffer.saturating_add(drained);
            let record = registry.retire(id, drained, residual, now)?;
            (record, registry.total_weight_bps())
        };

        if residual > 0 {
            warn!(target_id = %id, %residual, "Target removed with value left behind");
        }
        info!(target_id = %id, %drained, total_weight_bps, "Target removed");
        self.events
            .record(
                now,
                PortfolioEvent::TargetRemoved {
                    id: id.to_string(),
                    drained,
                    residual,
                    total_weight_bps,
                },
            )
            .await;
        Ok(record)
    }

    // =========================================================================
    // Gate administration
    // =========================================================================

    pub async fn set_rebalance_interval(&self, caller: &str, seconds: u64) -> PortfolioResult<()> {
        let _token = self.guard.enter("set_rebalance_interval")?;
        self.access.read().await.ensure_admin(caller)?;

        let old_secs = self.gate.write().await.set_interval(seconds)?;
        info!(old_secs, new_secs = seconds, "Rebalance interval updated");
        self.events
            .record(
                self.clock.now(),
                PortfolioEvent::IntervalUpdated {
                    old_secs,
                    new_secs: seconds,
                },
            )
            .await;
        Ok(())
    }

    pub async fn set_rebalance_threshold(&self, caller: &str, bps: u32) -> PortfolioResult<()> {
        let _token = self.guard.enter("set_rebalance_threshold")?;
        self.access.read().await.ensure_admin(caller)?;

        let old_bps = self.gate.write().await.set_threshold(bps)?;
        info!(old_bps, new_bps = bps, "Rebalance threshold updated");
        self.events
            .record(
                self.clock.now(),
                PortfolioEvent::ThresholdUpdated {
                    old_bps,
                    new_bps: bps,
                },
            )
            .await;
        Ok(())
    }

    // =========================================================================
    // Access administration
    // =========================================================================

    pub async fn grant_admin(&self, caller: &str, principal: &str) -> PortfolioResult<()> {
        let _token = self.guard.enter("grant_admin")?;
        let mut access = self.access.write().await;
        access.ensure_admin(caller)?;
        if access.grant(principal) {
            drop(access);
            self.events
                .record(
                    self.clock.now(),
                    PortfolioEvent::AdminGranted {
                        principal: principal.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    pub async fn revoke_admin(&self, caller: &str, principal: &str) -> PortfolioResult<()> {
        let _token = self.guard.enter("revoke_admin")?;
        let mut access = self.access.write().await;
        access.ensure_admin(caller)?;
        if access.revoke(principal)? {
            drop(access);
            self.events
                .record(
                    self.clock.now(),
                    PortfolioEvent::AdminRevoked {
                        principal: principal.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    /// Run one rebalance cycle.
    ///
    /// An empty portfolio is a successful no-op. Otherwise the gate must be
    /// open (interval elapsed or drift above threshold), else `TooEarly`.
    /// Adapter faults never fail the call; see the returned report.
    pub async fn rebalance(&self, caller: &str) -> PortfolioResult<RebalanceReport> {
        let _token = self.guard.enter("rebalance")?;
        self.access.read().await.ensure_admin(caller)?;

        let now = self.clock.now();
        let targets = self.registry.read().await.targets().to_vec();
        let (buffer, last_rebalance_at) = {
            let ledger = self.ledger.read().await;
            (ledger.buffer, ledger.last_rebalance_at)
        };
        let snapshot = ValuationAggregator::snapshot(buffer, &targets, now).await;

        if snapshot.total_value == 0 {
            info!("Nothing to rebalance, portfolio is empty");
            return Ok(RebalanceReport::empty(now, buffer));
        }

        let gate = *self.gate.read().await;
        let decision = gate.evaluate(&snapshot, last_rebalance_at, now);
        if !decision.needed {
            let elapsed_secs = RebalanceGate::elapsed_secs(last_rebalance_at, now).unwrap_or(0);
            info!(elapsed_secs, interval_secs = gate.interval_secs(), "Rebalance not due");
            return Err(PortfolioError::TooEarly {
                elapsed_secs,
                interval_secs: gate.interval_secs(),
            });
        }
        info!(reason = ?decision.reason, total_value = %snapshot.total_value, "Rebalance started");

        let plan = RebalancePlan::compute(&snapshot);
        let report = RebalanceEngine::execute(&plan, &targets, &self.ledger, now).await;
        self.ledger.write().await.last_rebalance_at = Some(now);

        self.events
            .record(
                now,
                PortfolioEvent::Rebalanced {
                    total_value: report.total_value,
                    withdrawn: report.total_withdrawn(),
                    allocated: report.total_allocated(),
                    buffer_after: report.buffer_after,
                    shortfalls: report.shortfalls(),
                    rejections: report.rejections(),
                },
            )
            .await;
        Ok(report)
    }

    /// Realize accrued yield from every active target into the buffer.
    pub async fn harvest_all(&self, caller: &str) -> PortfolioResult<Amount> {
        let _token = self.guard.enter("harvest_all")?;
        self.access.read().await.ensure_admin(caller)?;

        let targets = self.registry.read().await.targets().to_vec();
        let mut total: Amount = 0;
        let mut failures = 0;

        for target in &targets {
            match target.adapter.harvest_yield().await {
                Ok(0) => {}
                Ok(harvested) => {
                    let mut ledger = self.ledger.write().await;
                    ledger.buffer = ledger.buffer.saturating_add(harvested);
                    drop(ledger);
                    total = total.saturating_add(harvested);
                    info!(target_id = %target.id, %harvested, "Yield harvested");
                }
                Err(e) => {
                    failures += 1;
                    warn!(target_id = %target.id, error = %e, "Harvest failed");
                }
            }
        }

        self.events
            .record(self.clock.now(), PortfolioEvent::Harvested { total, failures })
            .await;
        Ok(total)
    }

    // =========================================================================
    // Deposit / redemption boundary
    // =========================================================================

    /// Add value to the buffer. Blocked while any guarded operation runs.
    ///
    /// Zero, or an amount that would overflow the buffer, is `InvalidAmount`.
    pub async fn deposit(&self, amount: Amount) -> PortfolioResult<Amount> {
        let _token = self.guard.enter("deposit")?;
        if amount == 0 {
            return Err(PortfolioError::InvalidAmount { amount });
        }

        let buffer = {
            let mut ledger = self.ledger.write().await;
            ledger.buffer = ledger
                .buffer
                .checked_add(amount)
                .ok_or(PortfolioError::InvalidAmount { amount })?;
            ledger.buffer
        };

        info!(%amount, %buffer, "Deposit received");
        self.events
            .record(self.clock.now(), PortfolioEvent::Deposited { amount, buffer })
            .await;
        Ok(buffer)
    }

    /// Pay out up to `amount` from the buffer.
    ///
    /// On a buffer shortfall, targets are withdrawn in registry order until the
    /// shortfall is covered or every target has been asked once. Returns the
    /// amount paid, which is less than requested when backends are illiquid.
    pub async fn redeem(&self, amount: Amount) -> PortfolioResult<Amount> {
        let _token = self.guard.enter("redeem")?;
        if amount == 0 {
            return Err(PortfolioError::InvalidAmount { amount });
        }

        let mut pulled: Amount = 0;
        let buffer = self.ledger.read().await.buffer;
        if buffer < amount {
            let targets = self.registry.read().await.targets().to_vec();
            let mut shortfall = amount - buffer;
            for target in &targets {
                if shortfall == 0 {
                    break;
                }
                let Some(value) = ValuationAggregator::read(&target.id, target.adapter.as_ref()).await else {
                    continue;
                };
                let requested = shortfall.min(value);
                if requested == 0 {
                    continue;
                }
                match target.adapter.withdraw(requested).await {
                    Ok(returned) => {
                        let actual = returned.min(requested);
                        let mut ledger = self.ledger.write().await;
                        ledger.buffer = ledger.buffer.saturating_add(actual);
                        drop(ledger);
                        pulled += actual;
                        shortfall -= actual;
                    }
                    Err(e) => {
                        warn!(target_id = %target.id, %requested, error = %e, "Redemption pull failed");
                    }
                }
            }
        }

        let (paid, buffer) = {
            let mut ledger = self.ledger.write().await;
            let paid = amount.min(ledger.buffer);
            ledger.buffer -= paid;
            (paid, ledger.buffer)
        };

        if paid < amount {
            warn!(requested = %amount, %paid, "Redemption only partially filled");
        }
        info!(requested = %amount, %paid, pulled_from_targets = %pulled, "Redemption paid");
        self.events
            .record(
                self.clock.now(),
                PortfolioEvent::Redeemed {
                    requested: amount,
                    paid,
                    pulled_from_targets: pulled,
                    buffer,
                },
            )
            .await;
        Ok(paid)
    }

    // =========================================================================
    // Read-only views
    // =========================================================================

    /// Active targets in registry order.
    pub async fn targets(&self) -> Vec<Target> {
        self.registry.read().await.targets().to_vec()
    }

    pub async fn retired_targets(&self) -> Vec<RetiredTarget> {
        self.registry.read().await.retired().to_vec()
    }

    pub async fn total_weight_bps(&self) -> u32 {
        self.registry.read().await.total_weight_bps()
    }

    /// Weight of an active target.
    pub async fn target_share(&self, id: &str) -> PortfolioResult<u32> {
        self.registry
            .read()
            .await
            .get(id)
            .map(|t| t.weight_bps)
            .ok_or_else(|| PortfolioError::NotFound { id: id.to_string() })
    }

    pub async fn buffer(&self) -> Amount {
        self.ledger.read().await.buffer
    }

    pub async fn last_rebalance_at(&self) -> Option<DateTime<Utc>> {
        self.ledger.read().await.last_rebalance_at
    }

    pub async fn gate(&self) -> RebalanceGate {
        *self.gate.read().await
    }

    /// Buffer plus every readable adapter valuation.
    pub async fn total_value(&self) -> Amount {
        self.valuation_snapshot().await.total_value
    }

    pub async fn valuation_snapshot(&self) -> ValuationSnapshot {
        let targets = self.registry.read().await.targets().to_vec();
        let buffer = self.ledger.read().await.buffer;
        ValuationAggregator::snapshot(buffer, &targets, self.clock.now()).await
    }

    pub async fn is_rebalance_needed(&self) -> bool {
        self.gate_decision().await.needed
    }

    pub async fn gate_decision(&self) -> GateDecision {
        let snapshot = self.valuation_snapshot().await;
        let last_rebalance_at = self.ledger.read().await.last_rebalance_at;
        self.gate
            .read()
            .await
            .evaluate(&snapshot, last_rebalance_at, self.clock.now())
    }

    pub async fn drift_report(&self) -> DriftReport {
        RebalanceGate::drift_report(&self.valuation_snapshot().await)
    }

    pub async fn snapshot(&self) -> PortfolioSnapshot {
        let valuation = self.valuation_snapshot().await;
        let (targets, retired, total_weight_bps) = {
            let registry = self.registry.read().await;
            (
                registry.targets().to_vec(),
                registry.retired().to_vec(),
                registry.total_weight_bps(),
            )
        };
        let gate = *self.gate.read().await;

        let targets = targets
            .iter()
            .enumerate()
            .map(|(position, t)| TargetSnapshot {
                position,
                id: t.id.clone(),
                weight_bps: t.weight_bps,
                value: valuation.get(&t.id).and_then(|v| v.value),
                added_at: t.added_at,
            })
            .collect();

        PortfolioSnapshot {
            taken_at: valuation.taken_at,
            buffer: valuation.buffer,
            total_value: valuation.total_value,
            total_weight_bps,
            rebalance_interval_secs: gate.interval_secs(),
            rebalance_threshold_bps: gate.threshold_bps(),
            last_rebalance_at: self.last_rebalance_at().await,
            targets,
            retired,
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Whether a guarded operation is currently running.
    pub fn is_busy(&self) -> bool {
        self.guard.is_busy()
    }
}
