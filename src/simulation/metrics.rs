//! Run metrics for simulations.

use crate::adapter::Amount;
use crate::utils::decimal::{amount_to_decimal, bps_to_percent, percent_change};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Portfolio state after one simulated step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    pub total_value: Amount,
    pub buffer: Amount,
    /// Largest drift of any target, in bps
    pub max_drift_bps: Amount,
    /// Whether a rebalance executed on this step
    pub rebalanced: bool,
}

/// Aggregate results of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationMetrics {
    // Value
    pub initial_value: Amount,
    pub final_value: Amount,
    /// Total return as percentage
    pub total_return_pct: Decimal,
    /// Maximum peak-to-trough decline, as percentage
    pub max_drawdown_pct: Decimal,

    // Rebalancing
    pub rebalances: u32,
    /// Steps where the gate stayed closed
    pub skipped: u32,
    pub total_withdrawn: Amount,
    pub total_allocated: Amount,
    /// Withdrawals that under-delivered or failed
    pub shortfalls: usize,
    /// Allocations that were declined or failed
    pub rejections: usize,
    /// Worst drift seen at the end of any step, as percentage
    pub peak_drift_pct: Decimal,

    // Yield
    pub total_harvested: Amount,

    pub steps: u32,
}

impl SimulationMetrics {
    /// Derive value metrics from the recorded curve.
    ///
    /// Activity counters start at zero and are filled in by the engine.
    pub fn from_curve(curve: &[ValuePoint]) -> Self {
        let initial_value = curve.first().map(|p| p.total_value).unwrap_or(0);
        let final_value = curve.last().map(|p| p.total_value).unwrap_or(0);

        let mut peak: Amount = 0;
        let mut max_drawdown = Decimal::ZERO;
        for point in curve {
            peak = peak.max(point.total_value);
            if peak > 0 {
                let drawdown = amount_to_decimal(peak - point.total_value) / amount_to_decimal(peak);
                max_drawdown = max_drawdown.max(drawdown);
            }
        }

        let peak_drift = curve.iter().map(|p| p.max_drift_bps).max().unwrap_or(0);

        Self {
            initial_value,
            final_value,
            total_return_pct: percent_change(initial_value, final_value),
            max_drawdown_pct: (max_drawdown * dec!(100)).round_dp(4),
            rebalances: 0,
            skipped: 0,
            total_withdrawn: 0,
            total_allocated: 0,
            shortfalls: 0,
            rejections: 0,
            peak_drift_pct: bps_to_percent(peak_drift),
            total_harvested: 0,
            steps: curve.len().saturating_sub(1) as u32,
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        format!(
            r#"═══════════════════════════════════════════════
SIMULATION RESULTS ({} steps)
═══════════════════════════════════════════════
VALUE
  Initial:           {}
  Final:             {} ({:.2}%)
  Max Drawdown:      {:.2}%

REBALANCING
  Rebalances:        {}
  Skipped (gated):   {}
  Withdrawn:         {}
  Allocated:         {}
  Shortfalls:        {}
  Rejections:        {}
  Peak Drift:        {:.2}%

YIELD
  Harvested:         {}
═══════════════════════════════════════════════"#,
            self.steps,
            self.initial_value,
            self.final_value,
            self.total_return_pct,
            self.max_drawdown_pct,
            self.rebalances,
            self.skipped,
            self.total_withdrawn,
            self.total_allocated,
            self.shortfalls,
            self.rejections,
            self.peak_drift_pct,
            self.total_harvested,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(step: u32, total_value: Amount, max_drift_bps: Amount) -> ValuePoint {
        ValuePoint {
            step,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            total_value,
            buffer: 0,
            max_drift_bps,
            rebalanced: false,
        }
    }

    #[test]
    fn test_metrics_from_curve() {
        let curve = vec![
            point(0, 1_000, 0),
            point(1, 1_200, 150),
            point(2, 900, 620),
            point(3, 1_100, 40),
        ];
        let metrics = SimulationMetrics::from_curve(&curve);

        assert_eq!(metrics.steps, 3);
        assert_eq!(metrics.total_return_pct, dec!(10));
        assert_eq!(metrics.max_drawdown_pct, dec!(25));
        assert_eq!(metrics.peak_drift_pct, dec!(6.2));
    }

    #[test]
    fn test_empty_curve() {
        let metrics = SimulationMetrics::from_curve(&[]);
        assert_eq!(metrics.initial_value, 0);
        assert_eq!(metrics.total_return_pct, Decimal::ZERO);
        assert_eq!(metrics.steps, 0);
        assert!(metrics.summary().contains("SIMULATION RESULTS"));
    }
}
