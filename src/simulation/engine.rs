//! Simulation engine.
//!
//! Drives a portfolio through `cycles` steps of `step_secs` each on a manual
//! clock. Lending targets accrue interest from that clock; paper targets get a
//! fixed mark-to-market return per step.

use crate::adapter::{
    AdapterKind, Amount, LendingConfig, LendingStrategy, PaperStrategy, StrategyAdapter,
};
use crate::config::{Config, TargetConfig};
use crate::error::PortfolioError;
use crate::persistence::PersistenceManager;
use crate::portfolio::{Portfolio, RebalanceOutcome, RebalanceReport};
use crate::simulation::metrics::{SimulationMetrics, ValuePoint};
use crate::utils::{Clock, ManualClock};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Complete result of a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub metrics: SimulationMetrics,
    pub value_curve: Vec<ValuePoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SimulationResult {
    /// Export the value curve to CSV.
    pub fn value_curve_to_csv(&self, path: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "step,timestamp,total_value,buffer,max_drift_bps,rebalanced")?;

        for point in &self.value_curve {
            writeln!(
                file,
                "{},{},{},{},{},{}",
                point.step,
                point.timestamp.to_rfc3339(),
                point.total_value,
                point.buffer,
                point.max_drift_bps,
                point.rebalanced,
            )?;
        }

        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        format!(
            "{}\n\nSimulated Period: {} to {}",
            self.metrics.summary(),
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"),
        )
    }
}

/// A paper target and the return it is marked with every step.
struct PaperLeg {
    id: String,
    strategy: PaperStrategy,
    return_bps_per_step: i32,
}

/// The simulation engine.
pub struct SimulationEngine {
    config: Config,
    clock: ManualClock,
    portfolio: Arc<Portfolio>,
    operator: String,
    paper_legs: Vec<PaperLeg>,
    persistence: Option<PersistenceManager>,
}

impl SimulationEngine {
    /// Build the portfolio and register every configured target.
    pub async fn new(config: Config, start: DateTime<Utc>) -> Result<Self> {
        config.validate()?;

        let operator = config
            .access
            .admins
            .first()
            .cloned()
            .context("No administrator configured")?;
        let clock = ManualClock::new(start);
        let portfolio = Arc::new(Portfolio::new(
            &config.rebalance,
            config.access.admins.iter().cloned(),
            Arc::new(clock.clone()),
        )?);

        let mut paper_legs = Vec::new();
        for target in &config.simulation.targets {
            let adapter: Arc<dyn StrategyAdapter> = match target.kind {
                AdapterKind::Lending => Arc::new(build_lending(target, &clock)?),
                AdapterKind::Paper => {
                    let strategy = PaperStrategy::new();
                    strategy
                        .set_accepts_allocations(target.accepts_allocations)
                        .await;
                    paper_legs.push(PaperLeg {
                        id: target.id.clone(),
                        strategy: strategy.clone(),
                        return_bps_per_step: target.return_bps_per_step,
                    });
                    Arc::new(strategy)
                }
            };
            portfolio
                .add_target(&operator, &target.id, adapter, target.weight_bps)
                .await
                .with_context(|| format!("Failed to register target {}", target.id))?;
            info!(
                target_id = %target.id,
                kind = %target.kind,
                weight_bps = target.weight_bps,
                "Simulation target registered"
            );
        }

        Ok(Self {
            config,
            clock,
            portfolio,
            operator,
            paper_legs,
            persistence: None,
        })
    }

    /// Write a snapshot after every step and every rebalance report.
    pub fn with_persistence(mut self, persistence: PersistenceManager) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn portfolio(&self) -> Arc<Portfolio> {
        Arc::clone(&self.portfolio)
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn persistence(&self) -> Option<&PersistenceManager> {
        self.persistence.as_ref()
    }

    /// Deposit, rebalance once, then step the clock `cycles` times.
    pub async fn run(&mut self) -> Result<SimulationResult> {
        let sim = self.config.simulation.clone();
        let start_time = self.clock.now();
        let mut tally = Tally::default();
        let mut curve = Vec::with_capacity(sim.cycles as usize + 1);

        info!(
            initial_deposit = sim.initial_deposit,
            cycles = sim.cycles,
            step_secs = sim.step_secs,
            targets = sim.targets.len(),
            "Starting simulation"
        );

        if sim.initial_deposit > 0 {
            self.portfolio.deposit(Amount::from(sim.initial_deposit)).await?;
        }
        let rebalanced = self.try_rebalance(&mut tally).await?;
        curve.push(self.record_point(0, rebalanced).await?);

        for step in 1..=sim.cycles {
            self.clock.advance_secs(sim.step_secs as i64);

            for leg in &self.paper_legs {
                if leg.return_bps_per_step != 0 {
                    leg.strategy.apply_return_bps(leg.return_bps_per_step).await;
                    debug!(target_id = %leg.id, bps = leg.return_bps_per_step, "Marked to market");
                }
            }

            if sim.harvest_every > 0 && step % sim.harvest_every == 0 {
                tally.harvested += self.portfolio.harvest_all(&self.operator).await?;
            }

            let rebalanced = self.try_rebalance(&mut tally).await?;
            curve.push(self.record_point(step, rebalanced).await?);
        }

        if let Some(persistence) = &self.persistence {
            persistence.record_events(&self.portfolio.events().all().await)?;
        }

        let mut metrics = SimulationMetrics::from_curve(&curve);
        tally.apply(&mut metrics);
        let end_time = self.clock.now();

        info!(
            final_value = %metrics.final_value,
            return_pct = %metrics.total_return_pct,
            rebalances = metrics.rebalances,
            "Simulation complete"
        );

        Ok(SimulationResult {
            metrics,
            value_curve: curve,
            start_time,
            end_time,
        })
    }

    /// Rebalance if the gate is open. A closed gate counts as a skipped step.
    async fn try_rebalance(&self, tally: &mut Tally) -> Result<bool> {
        match self.portfolio.rebalance(&self.operator).await {
            Ok(report) => {
                if let Some(persistence) = &self.persistence {
                    persistence.record_rebalance(&report)?;
                }
                Ok(tally.record(&report))
            }
            Err(PortfolioError::TooEarly { elapsed_secs, .. }) => {
                debug!(elapsed_secs, "Gate closed, skipping rebalance");
                tally.skipped += 1;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_point(&self, step: u32, rebalanced: bool) -> Result<ValuePoint> {
        let snapshot = self.portfolio.snapshot().await;
        if let Some(persistence) = &self.persistence {
            persistence.save_snapshot(&snapshot)?;
        }
        let drift = self.portfolio.drift_report().await;

        Ok(ValuePoint {
            step,
            timestamp: snapshot.taken_at,
            total_value: snapshot.total_value,
            buffer: snapshot.buffer,
            max_drift_bps: drift.max_drift_bps,
            rebalanced,
        })
    }
}

fn build_lending(target: &TargetConfig, clock: &ManualClock) -> Result<LendingStrategy> {
    LendingStrategy::new(
        LendingConfig {
            apr_bps: target.apr_bps,
            utilization_bps: target.utilization_bps,
        },
        Arc::new(clock.clone()),
    )
    .with_context(|| format!("Invalid lending parameters for {}", target.id))
}

/// Activity counters accumulated over a run.
#[derive(Debug, Default)]
struct Tally {
    rebalances: u32,
    skipped: u32,
    withdrawn: Amount,
    allocated: Amount,
    shortfalls: usize,
    rejections: usize,
    harvested: Amount,
}

impl Tally {
    /// Returns whether the report moved capital.
    fn record(&mut self, report: &RebalanceReport) -> bool {
        if report.outcome != RebalanceOutcome::Executed {
            return false;
        }
        self.rebalances += 1;
        self.withdrawn += report.total_withdrawn();
        self.allocated += report.total_allocated();
        self.shortfalls += report.shortfalls();
        self.rejections += report.rejections();
        true
    }

    fn apply(&self, metrics: &mut SimulationMetrics) {
        metrics.rebalances = self.rebalances;
        metrics.skipped = self.skipped;
        metrics.total_withdrawn = self.withdrawn;
        metrics.total_allocated = self.allocated;
        metrics.shortfalls = self.shortfalls;
        metrics.rejections = self.rejections;
        metrics.total_harvested = self.harvested;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RebalanceConfig, SimulationConfig};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn paper_target(id: &str, weight_bps: u32, return_bps_per_step: i32) -> TargetConfig {
        TargetConfig {
            id: id.to_string(),
            kind: AdapterKind::Paper,
            weight_bps,
            apr_bps: 0,
            utilization_bps: 0,
            return_bps_per_step,
            accepts_allocations: true,
        }
    }

    fn test_config(targets: Vec<TargetConfig>, cycles: u32) -> Config {
        Config {
            rebalance: RebalanceConfig {
                interval_secs: 86_400,
                threshold_bps: 500,
            },
            simulation: SimulationConfig {
                initial_deposit: 100_000,
                cycles,
                step_secs: 3_600,
                harvest_every: 0,
                targets,
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_flat_markets_rebalance_once() {
        let config = test_config(
            vec![paper_target("a", 6_000, 0), paper_target("b", 4_000, 0)],
            5,
        );
        let mut engine = SimulationEngine::new(config, start()).await.unwrap();
        let result = engine.run().await.unwrap();

        assert_eq!(result.metrics.rebalances, 1);
        assert_eq!(result.metrics.skipped, 5);
        assert_eq!(result.metrics.total_allocated, 100_000);
        assert_eq!(result.metrics.final_value, 100_000);
        assert_eq!(result.value_curve.len(), 6);
        assert!(result.value_curve[0].rebalanced);
        assert_eq!(result.end_time - result.start_time, chrono::Duration::hours(5));
    }

    #[tokio::test]
    async fn test_divergent_returns_trigger_drift_rebalances() {
        let config = test_config(
            vec![paper_target("up", 5_000, 300), paper_target("down", 5_000, -300)],
            4,
        );
        let mut engine = SimulationEngine::new(config, start()).await.unwrap();
        let result = engine.run().await.unwrap();

        // The legs drift about 1.5% of total value apart per step, so the 5%
        // threshold is first crossed on step 4.
        assert_eq!(result.metrics.rebalances, 2);
        assert_eq!(result.metrics.skipped, 3);
        assert!(result.value_curve[4].rebalanced);
        assert!(result.metrics.total_withdrawn > 0);
        let last = result.value_curve.last().unwrap();
        assert!(last.max_drift_bps <= 500);
    }

    #[tokio::test]
    async fn test_lending_yield_is_harvested_and_persisted() {
        let mut config = test_config(
            vec![TargetConfig {
                id: "pool".to_string(),
                kind: AdapterKind::Lending,
                weight_bps: 8_000,
                apr_bps: 1_000,
                utilization_bps: 5_000,
                return_bps_per_step: 0,
                accepts_allocations: true,
            }],
            48,
        );
        config.simulation.harvest_every = 24;

        let persistence = PersistenceManager::in_memory().unwrap();
        let mut engine = SimulationEngine::new(config, start())
            .await
            .unwrap()
            .with_persistence(persistence);
        let result = engine.run().await.unwrap();

        assert!(result.metrics.total_harvested > 0);
        assert!(result.metrics.final_value > 100_000);

        let persistence = engine.persistence().unwrap();
        let snapshot = persistence.load_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.targets.len(), 1);
        assert_eq!(snapshot.taken_at, engine.clock().now());
        assert!(!persistence.recent_rebalances(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejecting_target_keeps_capital_in_buffer() {
        let mut rejecting = paper_target("closed", 5_000, 0);
        rejecting.accepts_allocations = false;
        let config = test_config(vec![paper_target("open", 5_000, 0), rejecting], 1);

        let mut engine = SimulationEngine::new(config, start()).await.unwrap();
        let result = engine.run().await.unwrap();

        // The unfilled target keeps drift above threshold, so the gate reopens
        // on the next step and the allocation is declined again.
        assert_eq!(result.metrics.rejections, 2);
        assert_eq!(result.value_curve[0].buffer, 50_000);
        assert_eq!(engine.portfolio().buffer().await, 50_000);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = test_config(
            vec![paper_target("a", 6_000, 0), paper_target("b", 6_000, 0)],
            1,
        );
        assert!(SimulationEngine::new(config, start()).await.is_err());
    }
}
