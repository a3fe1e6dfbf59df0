//! SQLite persistence for portfolio state.
//!
//! Persists the portfolio to survive restarts:
//! - Buffer, gate parameters and last rebalance time
//! - Active targets in registry order, with their last known value
//! - Retired targets and what was left behind
//! - Rebalance report history
//! - Domain event journal
//!
//! Amounts are stored as TEXT since they do not fit SQLite integers.

use crate::adapter::Amount;
use crate::portfolio::{
    EventRecord, PortfolioSnapshot, RebalanceOutcome, RebalanceReport, RetiredTarget,
    TargetSnapshot,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info, warn};

/// One row of rebalance history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: RebalanceOutcome,
    pub total_value: Amount,
    pub withdrawn: Amount,
    pub allocated: Amount,
    pub buffer_after: Amount,
    pub shortfalls: usize,
    pub rejections: usize,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Create a new persistence manager, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {:?}", parent)
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    /// In-memory database, for simulations and tests.
    pub fn in_memory() -> Result<Self> {
        let manager = Self {
            conn: Connection::open_in_memory().context("Failed to open in-memory database")?,
        };
        manager.init_schema()?;
        Ok(manager)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Portfolio state (singleton row)
            CREATE TABLE IF NOT EXISTS portfolio_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                buffer TEXT NOT NULL,
                total_value TEXT NOT NULL,
                total_weight_bps INTEGER NOT NULL,
                rebalance_interval_secs INTEGER NOT NULL,
                rebalance_threshold_bps INTEGER NOT NULL,
                last_rebalance_at TEXT,
                saved_at TEXT NOT NULL
            );

            -- Active targets, registry order is `position`
            CREATE TABLE IF NOT EXISTS targets (
                position INTEGER PRIMARY KEY,
                target_id TEXT NOT NULL UNIQUE,
                weight_bps INTEGER NOT NULL,
                last_value TEXT,
                added_at TEXT NOT NULL
            );

            -- Removed targets
            CREATE TABLE IF NOT EXISTS retired_targets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id TEXT NOT NULL,
                weight_bps INTEGER NOT NULL,
                added_at TEXT NOT NULL,
                removed_at TEXT NOT NULL,
                drained TEXT NOT NULL,
                residual TEXT NOT NULL
            );

            -- Rebalance history
            CREATE TABLE IF NOT EXISTS rebalances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                outcome TEXT NOT NULL,
                total_value TEXT NOT NULL,
                withdrawn TEXT NOT NULL,
                allocated TEXT NOT NULL,
                buffer_after TEXT NOT NULL,
                shortfalls INTEGER NOT NULL,
                rejections INTEGER NOT NULL,
                report_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rebalances_timestamp ON rebalances(timestamp);

            -- Event journal
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sequence INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Save a complete portfolio snapshot, replacing the previous one.
    pub fn save_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO portfolio_state (id, buffer, total_value, total_weight_bps,
                                         rebalance_interval_secs, rebalance_threshold_bps,
                                         last_rebalance_at, saved_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                buffer = ?1,
                total_value = ?2,
                total_weight_bps = ?3,
                rebalance_interval_secs = ?4,
                rebalance_threshold_bps = ?5,
                last_rebalance_at = ?6,
                saved_at = ?7
            "#,
            params![
                snapshot.buffer.to_string(),
                snapshot.total_value.to_string(),
                snapshot.total_weight_bps,
                snapshot.rebalance_interval_secs as i64,
                snapshot.rebalance_threshold_bps,
                snapshot.last_rebalance_at.map(|t| t.to_rfc3339()),
                snapshot.taken_at.to_rfc3339(),
            ],
        )?;

        // Clear and reinsert targets
        tx.execute("DELETE FROM targets", [])?;
        for target in &snapshot.targets {
            tx.execute(
                r#"
                INSERT INTO targets (position, target_id, weight_bps, last_value, added_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    target.position as i64,
                    target.id,
                    target.weight_bps,
                    target.value.map(|v| v.to_string()),
                    target.added_at.to_rfc3339(),
                ],
            )?;
        }

        tx.execute("DELETE FROM retired_targets", [])?;
        for retired in &snapshot.retired {
            tx.execute(
                r#"
                INSERT INTO retired_targets (target_id, weight_bps, added_at, removed_at, drained, residual)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    retired.id,
                    retired.weight_bps,
                    retired.added_at.to_rfc3339(),
                    retired.removed_at.to_rfc3339(),
                    retired.drained.to_string(),
                    retired.residual.to_string(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            buffer = %snapshot.buffer,
            targets = snapshot.targets.len(),
            "Portfolio snapshot saved"
        );
        Ok(())
    }

    /// Load the last saved snapshot.
    pub fn load_snapshot(&self) -> Result<Option<PortfolioSnapshot>> {
        #[allow(clippy::type_complexity)]
        let state_row: Option<(String, String, u32, i64, u32, Option<String>, String)> = self
            .conn
            .query_row(
                r#"
                SELECT buffer, total_value, total_weight_bps, rebalance_interval_secs,
                       rebalance_threshold_bps, last_rebalance_at, saved_at
                FROM portfolio_state WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((buffer, total_value, total_weight_bps, interval, threshold, last_rebalance, saved_at)) =
            state_row
        else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT position, target_id, weight_bps, last_value, added_at
            FROM targets
            ORDER BY position
            "#,
        )?;
        let target_rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut targets = Vec::with_capacity(target_rows.len());
        for (position, id, weight_bps, last_value, added_at) in target_rows {
            targets.push(TargetSnapshot {
                position: position as usize,
                value: last_value.as_deref().map(parse_amount).transpose()?,
                added_at: parse_timestamp(&added_at)?,
                id,
                weight_bps,
            });
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT target_id, weight_bps, added_at, removed_at, drained, residual
            FROM retired_targets
            ORDER BY id
            "#,
        )?;
        let retired_rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut retired = Vec::with_capacity(retired_rows.len());
        for (id, weight_bps, added_at, removed_at, drained, residual) in retired_rows {
            retired.push(RetiredTarget {
                id,
                weight_bps,
                added_at: parse_timestamp(&added_at)?,
                removed_at: parse_timestamp(&removed_at)?,
                drained: parse_amount(&drained)?,
                residual: parse_amount(&residual)?,
            });
        }

        let snapshot = PortfolioSnapshot {
            taken_at: parse_timestamp(&saved_at)?,
            buffer: parse_amount(&buffer)?,
            total_value: parse_amount(&total_value)?,
            total_weight_bps,
            rebalance_interval_secs: interval as u64,
            rebalance_threshold_bps: threshold,
            last_rebalance_at: last_rebalance.as_deref().map(parse_timestamp).transpose()?,
            targets,
            retired,
        };

        info!(
            buffer = %snapshot.buffer,
            targets = snapshot.targets.len(),
            saved_at = %snapshot.taken_at,
            "Loaded portfolio snapshot from database"
        );

        Ok(Some(snapshot))
    }

    /// Record a rebalance report.
    pub fn record_rebalance(&self, report: &RebalanceReport) -> Result<()> {
        let report_json =
            serde_json::to_string(report).context("Failed to serialize rebalance report")?;

        self.conn.execute(
            r#"
            INSERT INTO rebalances (timestamp, outcome, total_value, withdrawn, allocated,
                                    buffer_after, shortfalls, rejections, report_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                report.timestamp.to_rfc3339(),
                outcome_label(report.outcome),
                report.total_value.to_string(),
                report.total_withdrawn().to_string(),
                report.total_allocated().to_string(),
                report.buffer_after.to_string(),
                report.shortfalls() as i64,
                report.rejections() as i64,
                report_json,
            ],
        )?;
        Ok(())
    }

    /// Most recent rebalances, newest first.
    pub fn recent_rebalances(&self, limit: usize) -> Result<Vec<RebalanceRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, outcome, total_value, withdrawn, allocated, buffer_after,
                   shortfalls, rejections
            FROM rebalances
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(ts, outcome, total, withdrawn, allocated, buffer_after, shortfalls, rejections)| {
                    Ok(RebalanceRecord {
                        timestamp: parse_timestamp(&ts)?,
                        outcome: parse_outcome(&outcome)?,
                        total_value: parse_amount(&total)?,
                        withdrawn: parse_amount(&withdrawn)?,
                        allocated: parse_amount(&allocated)?,
                        buffer_after: parse_amount(&buffer_after)?,
                        shortfalls: shortfalls as usize,
                        rejections: rejections as usize,
                    })
                },
            )
            .collect()
    }

    /// Full report of the latest rebalance, per-target outcomes included.
    pub fn last_rebalance_report(&self) -> Result<Option<RebalanceReport>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT report_json FROM rebalances ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| serde_json::from_str(&j).context("Corrupt rebalance report"))
            .transpose()
    }

    /// Append events to the journal.
    pub fn record_events(&self, records: &[EventRecord]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for record in records {
            let payload =
                serde_json::to_string(record).context("Failed to serialize portfolio event")?;
            tx.execute(
                r#"
                INSERT INTO events (sequence, timestamp, event_type, payload)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    record.sequence as i64,
                    record.timestamp.to_rfc3339(),
                    record.event.name(),
                    payload,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of journaled events per type.
    pub fn event_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT event_type, COUNT(*)
            FROM events
            GROUP BY event_type
            ORDER BY event_type
            "#,
        )?;

        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Check if we have any saved state.
    pub fn has_state(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM portfolio_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all persistence data");
        self.conn.execute_batch(
            r#"
            DELETE FROM portfolio_state;
            DELETE FROM targets;
            DELETE FROM retired_targets;
            DELETE FROM rebalances;
            DELETE FROM events;
            "#,
        )?;
        Ok(())
    }
}

fn parse_amount(s: &str) -> Result<Amount> {
    s.parse::<Amount>()
        .with_context(|| format!("Invalid stored amount {:?}", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp {:?}", s))
}

fn outcome_label(outcome: RebalanceOutcome) -> &'static str {
    match outcome {
        RebalanceOutcome::Executed => "executed",
        RebalanceOutcome::EmptyPortfolio => "empty_portfolio",
    }
}

fn parse_outcome(s: &str) -> Result<RebalanceOutcome> {
    match s {
        "executed" => Ok(RebalanceOutcome::Executed),
        "empty_portfolio" => Ok(RebalanceOutcome::EmptyPortfolio),
        other => anyhow::bail!("Unknown rebalance outcome {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::{MoveAction, TargetOutcome};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn sample_snapshot() -> PortfolioSnapshot {
        PortfolioSnapshot {
            taken_at: at(12),
            buffer: 1_250,
            total_value: 101_250,
            total_weight_bps: 9_000,
            rebalance_interval_secs: 86_400,
            rebalance_threshold_bps: 500,
            last_rebalance_at: Some(at(6)),
            targets: vec![
                TargetSnapshot {
                    position: 0,
                    id: "lending-core".to_string(),
                    weight_bps: 6_000,
                    value: Some(60_000),
                    added_at: at(0),
                },
                TargetSnapshot {
                    position: 1,
                    id: "basis-trade".to_string(),
                    weight_bps: 3_000,
                    value: None,
                    added_at: at(1),
                },
            ],
            retired: vec![RetiredTarget {
                id: "old-vault".to_string(),
                weight_bps: 1_000,
                added_at: at(0),
                removed_at: at(5),
                drained: 9_000,
                residual: 40,
            }],
        }
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let manager = PersistenceManager::in_memory().unwrap();
        assert!(!manager.has_state().unwrap());
        assert!(manager.load_snapshot().unwrap().is_none());

        let snapshot = sample_snapshot();
        manager.save_snapshot(&snapshot).unwrap();

        assert!(manager.has_state().unwrap());
        let loaded = manager.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_save_replaces_previous_targets() {
        let manager = PersistenceManager::in_memory().unwrap();
        manager.save_snapshot(&sample_snapshot()).unwrap();

        let mut snapshot = sample_snapshot();
        snapshot.targets.truncate(1);
        snapshot.buffer = u128::from(u64::MAX) * 4;
        manager.save_snapshot(&snapshot).unwrap();

        let loaded = manager.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.targets.len(), 1);
        assert_eq!(loaded.buffer, u128::from(u64::MAX) * 4);
    }

    #[test]
    fn test_rebalance_history() {
        let manager = PersistenceManager::in_memory().unwrap();

        let mut first = RebalanceReport::empty(at(1), 0);
        first.outcome = RebalanceOutcome::Executed;
        first.total_value = 10_000;
        first.buffer_after = 2_000;
        first.outcomes.push(TargetOutcome {
            id: "a".to_string(),
            current_value: Some(8_000),
            target_value: 5_000,
            action: MoveAction::Withdrew {
                requested: 3_000,
                actual: 1_000,
            },
        });
        manager.record_rebalance(&first).unwrap();
        manager
            .record_rebalance(&RebalanceReport::empty(at(2), 0))
            .unwrap();

        let history = manager.recent_rebalances(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, RebalanceOutcome::EmptyPortfolio);
        assert_eq!(history[1].withdrawn, 1_000);
        assert_eq!(history[1].shortfalls, 1);

        let last = manager.last_rebalance_report().unwrap().unwrap();
        assert_eq!(last.timestamp, at(2));
        assert_eq!(manager.recent_rebalances(1).unwrap().len(), 1);
    }

    #[test]
    fn test_event_journal_counts() {
        use crate::portfolio::PortfolioEvent;

        let manager = PersistenceManager::in_memory().unwrap();
        let records = vec![
            EventRecord {
                sequence: 1,
                timestamp: at(0),
                event: PortfolioEvent::Deposited {
                    amount: 100,
                    buffer: 100,
                },
            },
            EventRecord {
                sequence: 2,
                timestamp: at(1),
                event: PortfolioEvent::Deposited {
                    amount: 50,
                    buffer: 150,
                },
            },
            EventRecord {
                sequence: 3,
                timestamp: at(2),
                event: PortfolioEvent::Harvested {
                    total: 7,
                    failures: 0,
                },
            },
        ];
        manager.record_events(&records).unwrap();

        let counts = manager.event_counts().unwrap();
        assert_eq!(
            counts,
            vec![("Deposited".to_string(), 2), ("Harvested".to_string(), 1)]
        );

        manager.clear_all().unwrap();
        assert!(manager.event_counts().unwrap().is_empty());
    }
}
