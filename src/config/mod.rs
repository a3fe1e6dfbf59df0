//! Configuration management for the capital rebalancer.
//!
//! Loads settings from environment variables and config files.

use crate::adapter::AdapterKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rebalance gating parameters
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Administrator principals
    #[serde(default)]
    pub access: AccessConfig,
    /// State storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Paper simulation setup
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Minimum seconds between interval-driven rebalances
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Drift (bps of total value) that opens the gate before the interval elapses
    #[serde(default = "default_threshold_bps")]
    pub threshold_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Principals allowed to mutate targets and trigger rebalances
    #[serde(default = "default_admins")]
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Initial deposit into the buffer, in base units
    #[serde(default = "default_initial_deposit")]
    pub initial_deposit: u64,
    /// Number of simulated steps
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    /// Simulated seconds per step
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    /// Harvest yield every N steps (0 = never)
    #[serde(default = "default_harvest_every")]
    pub harvest_every: u32,
    /// Targets registered at the start of the run, in order
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub kind: AdapterKind,
    pub weight_bps: u32,
    /// Lending APR in bps (lending only)
    #[serde(default)]
    pub apr_bps: u32,
    /// Share of a lending pool that is lent out and illiquid (lending only)
    #[serde(default)]
    pub utilization_bps: u32,
    /// Mark-to-market return applied every step (paper only)
    #[serde(default)]
    pub return_bps_per_step: i32,
    /// Whether the backend accepts new capital (paper only)
    #[serde(default = "default_true")]
    pub accepts_allocations: bool,
}

// Default value functions
fn default_interval_secs() -> u64 {
    86_400 // daily
}

fn default_threshold_bps() -> u32 {
    500 // 5% drift
}

fn default_admins() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_db_path() -> String {
    "data/portfolio.db".to_string()
}

fn default_initial_deposit() -> u64 {
    1_000_000
}

fn default_cycles() -> u32 {
    30
}

fn default_step_secs() -> u64 {
    21_600 // 6h
}

fn default_harvest_every() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_targets() -> Vec<TargetConfig> {
    vec![
        TargetConfig {
            id: "lending-core".to_string(),
            kind: AdapterKind::Lending,
            weight_bps: 5_000,
            apr_bps: 450,
            utilization_bps: 7_000,
            return_bps_per_step: 0,
            accepts_allocations: true,
        },
        TargetConfig {
            id: "synthetic-index".to_string(),
            kind: AdapterKind::Paper,
            weight_bps: 3_000,
            apr_bps: 0,
            utilization_bps: 0,
            return_bps_per_step: 40,
            accepts_allocations: true,
        },
        TargetConfig {
            id: "basis-trade".to_string(),
            kind: AdapterKind::Paper,
            weight_bps: 1_500,
            apr_bps: 0,
            utilization_bps: 0,
            return_bps_per_step: -15,
            accepts_allocations: true,
        },
    ]
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CRB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.rebalance.interval_secs <= u64::from(u32::MAX),
            "rebalance.interval_secs must fit in 32 bits"
        );

        anyhow::ensure!(
            self.rebalance.threshold_bps <= 10_000,
            "rebalance.threshold_bps must be at most 10000"
        );

        anyhow::ensure!(
            !self.access.admins.is_empty(),
            "access.admins must name at least one administrator"
        );

        let mut seen = HashSet::new();
        for target in &self.simulation.targets {
            anyhow::ensure!(!target.id.trim().is_empty(), "target id must not be empty");
            anyhow::ensure!(seen.insert(&target.id), "duplicate target id {}", target.id);
            anyhow::ensure!(
                target.weight_bps >= 1 && target.weight_bps <= 10_000,
                "target {} weight_bps must be within 1..=10000",
                target.id
            );
            anyhow::ensure!(
                target.utilization_bps <= 10_000,
                "target {} utilization_bps must be at most 10000",
                target.id
            );
        }

        let total_weight: u32 = self.simulation.targets.iter().map(|t| t.weight_bps).sum();
        anyhow::ensure!(
            total_weight <= 10_000,
            "simulation target weights sum to {} bps (max 10000)",
            total_weight
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rebalance: RebalanceConfig::default(),
            access: AccessConfig::default(),
            persistence: PersistenceConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            threshold_bps: default_threshold_bps(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            admins: default_admins(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_deposit: default_initial_deposit(),
            cycles: default_cycles(),
            step_secs: default_step_secs(),
            harvest_every: default_harvest_every(),
            targets: default_targets(),
        }
    }
}
