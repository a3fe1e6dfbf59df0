//! Portfolio valuation across heterogeneous backends.

use super::registry::Target;
use crate::adapter::{Amount, StrategyAdapter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Valuation of a single target at one observation point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetValuation {
    pub id: String,
    pub weight_bps: u32,
    /// `None` when the adapter could not be read
    pub value: Option<Amount>,
}

impl TargetValuation {
    /// Value used for totals: a failed read counts as zero.
    pub fn value_or_zero(&self) -> Amount {
        self.value.unwrap_or(0)
    }
}

/// Consistent view of the portfolio at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationSnapshot {
    pub taken_at: DateTime<Utc>,
    pub buffer: Amount,
    /// Active targets in registry order
    pub targets: Vec<TargetValuation>,
    /// `buffer` plus every readable target value
    pub total_value: Amount,
}

impl ValuationSnapshot {
    pub fn get(&self, id: &str) -> Option<&TargetValuation> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Number of targets whose valuation could not be read.
    pub fn failed_reads(&self) -> usize {
        self.targets.iter().filter(|t| t.value.is_none()).count()
    }

    /// Sum of readable target values, excluding the buffer.
    pub fn invested_value(&self) -> Amount {
        self.total_value - self.buffer
    }
}

/// Sums buffer and adapter valuations.
pub struct ValuationAggregator;

impl ValuationAggregator {
    /// Read every target once, in registry order.
    ///
    /// A failing adapter reads as zero in `total_value` for this snapshot only;
    /// nothing is recorded against the target.
    pub async fn snapshot(
        buffer: Amount,
        targets: &[Target],
        taken_at: DateTime<Utc>,
    ) -> ValuationSnapshot {
        let mut valuations = Vec::with_capacity(targets.len());
        let mut total_value = buffer;

        for target in targets {
            let value = Self::read(&target.id, target.adapter.as_ref()).await;
            total_value = total_value.saturating_add(value.unwrap_or(0));
            valuations.push(TargetValuation {
                id: target.id.clone(),
                weight_bps: target.weight_bps,
                value,
            });
        }

        debug!(
            %buffer,
            %total_value,
            targets = valuations.len(),
            "Portfolio valued"
        );

        ValuationSnapshot {
            taken_at,
            buffer,
            targets: valuations,
            total_value,
        }
    }

    /// Read one adapter, degrading failures to `None`.
    pub async fn read(id: &str, adapter: &dyn StrategyAdapter) -> Option<Amount> {
        match adapter.valuation().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target_id = %id, error = %e, "Valuation read failed, counting as zero");
                None
            }
        }
    }
}
