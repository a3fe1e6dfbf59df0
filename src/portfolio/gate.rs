//! Interval and drift gating for rebalances.

use super::valuation::ValuationSnapshot;
use crate::adapter::Amount;
use crate::error::{PortfolioError, PortfolioResult};
use crate::utils::decimal::{bps_of, bps_to_percent, ratio_bps, BPS_DENOMINATOR};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Largest accepted rebalance interval (fits in 32 bits).
pub const MAX_REBALANCE_INTERVAL_SECS: u64 = u32::MAX as u64;

/// Why the gate opened or stayed shut.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateReason {
    /// Nothing to distribute
    EmptyPortfolio,
    /// Never rebalanced, or the interval has elapsed
    IntervalElapsed { elapsed_secs: Option<u64> },
    /// A target drifted past the threshold
    DriftExceeded { id: String, drift_bps: Amount },
    NotDue { elapsed_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub needed: bool,
    pub reason: GateReason,
}

/// Drift of one target against its weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub id: String,
    pub weight_bps: u32,
    pub current_value: Option<Amount>,
    pub target_value: Amount,
    /// `|current - target| * 10000 / total`
    pub drift_bps: Amount,
    pub drift_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub total_value: Amount,
    pub entries: Vec<DriftEntry>,
    pub max_drift_bps: Amount,
}

/// Decides whether a rebalance may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceGate {
    interval_secs: u64,
    threshold_bps: u32,
}

impl RebalanceGate {
    pub fn new(interval_secs: u64, threshold_bps: u32) -> PortfolioResult<Self> {
        validate_interval(interval_secs)?;
        validate_threshold(threshold_bps)?;
        Ok(Self {
            interval_secs,
            threshold_bps,
        })
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn threshold_bps(&self) -> u32 {
        self.threshold_bps
    }

    /// Returns the previous interval.
    pub fn set_interval(&mut self, seconds: u64) -> PortfolioResult<u64> {
        validate_interval(seconds)?;
        Ok(std::mem::replace(&mut self.interval_secs, seconds))
    }

    /// Returns the previous threshold.
    pub fn set_threshold(&mut self, bps: u32) -> PortfolioResult<u32> {
        validate_threshold(bps)?;
        Ok(std::mem::replace(&mut self.threshold_bps, bps))
    }

    /// Seconds since the last rebalance, `None` if there never was one.
    pub fn elapsed_secs(last_rebalance_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
        last_rebalance_at.map(|last| (now - last).num_seconds().max(0) as u64)
    }

    /// Evaluate interval first, then drift.
    ///
    /// An empty portfolio never needs rebalancing. A target whose valuation
    /// could not be read counts as holding 0.
    pub fn evaluate(
        &self,
        snapshot: &ValuationSnapshot,
        last_rebalance_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> GateDecision {
        if snapshot.total_value == 0 {
            return GateDecision {
                needed: false,
                reason: GateReason::EmptyPortfolio,
            };
        }

        let elapsed = Self::elapsed_secs(last_rebalance_at, now);
        if elapsed.map_or(true, |secs| secs >= self.interval_secs) {
            return GateDecision {
                needed: true,
                reason: GateReason::IntervalElapsed {
                    elapsed_secs: elapsed,
                },
            };
        }

        let threshold = Amount::from(self.threshold_bps);
        for entry in Self::drift_report(snapshot).entries {
            if entry.drift_bps > threshold {
                return GateDecision {
                    needed: true,
                    reason: GateReason::DriftExceeded {
                        id: entry.id,
                        drift_bps: entry.drift_bps,
                    },
                };
            }
        }

        GateDecision {
            needed: false,
            reason: GateReason::NotDue {
                elapsed_secs: elapsed.unwrap_or(0),
            },
        }
    }

    /// Per-target drift against the snapshot total.
    pub fn drift_report(snapshot: &ValuationSnapshot) -> DriftReport {
        let total = snapshot.total_value;
        let entries: Vec<DriftEntry> = snapshot
            .targets
            .iter()
            .map(|t| {
                let target_value = bps_of(total, t.weight_bps);
                let current = t.value_or_zero();
                let drift_bps = ratio_bps(current.abs_diff(target_value), total);
                DriftEntry {
                    id: t.id.clone(),
                    weight_bps: t.weight_bps,
                    current_value: t.value,
                    target_value,
                    drift_bps,
                    drift_pct: bps_to_percent(drift_bps),
                }
            })
            .collect();
        let max_drift_bps = entries
            .iter()
            .map(|e| e.drift_bps)
            .max()
            .unwrap_or(0);

        DriftReport {
            total_value: total,
            entries,
            max_drift_bps,
        }
    }
}

fn validate_interval(seconds: u64) -> PortfolioResult<()> {
    if seconds > MAX_REBALANCE_INTERVAL_SECS {
        return Err(PortfolioError::InvalidInterval {
            seconds,
            max: MAX_REBALANCE_INTERVAL_SECS,
        });
    }
    Ok(())
}

fn validate_threshold(bps: u32) -> PortfolioResult<()> {
    if bps > BPS_DENOMINATOR {
        return Err(PortfolioError::InvalidThreshold { bps });
    }
    Ok(())
}
