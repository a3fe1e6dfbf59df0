//! Domain effects emitted by the portfolio.
//!
//! Each event is kept in an in-memory log and written as a JSON line to the
//! `portfolio_event` tracing target for downstream log analysis.

use crate::adapter::Amount;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PortfolioEvent {
    TargetAdded {
        id: String,
        weight_bps: u32,
        total_weight_bps: u32,
    },
    WeightUpdated {
        id: String,
        old_weight_bps: u32,
        new_weight_bps: u32,
        total_weight_bps: u32,
    },
    TargetRemoved {
        id: String,
        drained: Amount,
        residual: Amount,
        total_weight_bps: u32,
    },
    Rebalanced {
        total_value: Amount,
        withdrawn: Amount,
        allocated: Amount,
        buffer_after: Amount,
        shortfalls: usize,
        rejections: usize,
    },
    Harvested {
        total: Amount,
        failures: usize,
    },
    Deposited {
        amount: Amount,
        buffer: Amount,
    },
    Redeemed {
        requested: Amount,
        paid: Amount,
        pulled_from_targets: Amount,
        buffer: Amount,
    },
    IntervalUpdated {
        old_secs: u64,
        new_secs: u64,
    },
    ThresholdUpdated {
        old_bps: u32,
        new_bps: u32,
    },
    AdminGranted {
        principal: String,
    },
    AdminRevoked {
        principal: String,
    },
}

impl PortfolioEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PortfolioEvent::TargetAdded { .. } => "TargetAdded",
            PortfolioEvent::WeightUpdated { .. } => "WeightUpdated",
            PortfolioEvent::TargetRemoved { .. } => "TargetRemoved",
            PortfolioEvent::Rebalanced { .. } => "Rebalanced",
            PortfolioEvent::Harvested { .. } => "Harvested",
            PortfolioEvent::Deposited { .. } => "Deposited",
            PortfolioEvent::Redeemed { .. } => "Redeemed",
            PortfolioEvent::IntervalUpdated { .. } => "IntervalUpdated",
            PortfolioEvent::ThresholdUpdated { .. } => "ThresholdUpdated",
            PortfolioEvent::AdminGranted { .. } => "AdminGranted",
            PortfolioEvent::AdminRevoked { .. } => "AdminRevoked",
        }
    }
}

/// An event with the time it was recorded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PortfolioEvent,
}

impl EventRecord {
    /// Emit as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        info!(target: "portfolio_event", "PORTFOLIO_EVENT: {}", json);
    }
}

/// Append-only event log.
#[derive(Debug, Default)]
pub struct EventLog {
    records: RwLock<Vec<EventRecord>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, timestamp: DateTime<Utc>, event: PortfolioEvent) {
        let mut records = self.records.write().await;
        let record = EventRecord {
            sequence: records.len() as u64 + 1,
            timestamp,
            event,
        };
        record.emit();
        records.push(record);
    }

    pub async fn all(&self) -> Vec<EventRecord> {
        self.records.read().await.clone()
    }

    pub async fn last(&self) -> Option<EventRecord> {
        self.records.read().await.last().cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_are_sequenced() {
        let log = EventLog::new();
        log.record(Utc::now(), PortfolioEvent::Deposited { amount: 10, buffer: 10 })
            .await;
        log.record(
            Utc::now(),
            PortfolioEvent::AdminGranted {
                principal: "ops".to_string(),
            },
        )
        .await;

        let records = log.all().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].event.name(), "AdminGranted");
    }

    #[test]
    fn test_event_serializes_flat_with_type_tag() {
        let record = EventRecord {
            sequence: 7,
            timestamp: Utc::now(),
            event: PortfolioEvent::TargetAdded {
                id: "lending".to_string(),
                weight_bps: 6_000,
                total_weight_bps: 6_000,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["type"], "TargetAdded");
        assert_eq!(json["id"], "lending");
        assert_eq!(json["sequence"], 7);
    }
}
