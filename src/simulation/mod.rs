//! Paper simulation of a portfolio on a simulated clock.
//!
//! This module provides:
//! - Adapter construction from `[[simulation.targets]]` config entries
//! - A step loop that moves the clock, marks paper targets to market,
//!   harvests yield and rebalances whenever the gate opens
//! - Run metrics and an optional SQLite trail of snapshots and reports
//!
//! # Example
//!
//! ```rust,ignore
//! use capital_rebalancer::simulation::SimulationEngine;
//!
//! let mut engine = SimulationEngine::new(config, Utc::now()).await?;
//! let result = engine.run().await?;
//! println!("{}", result.summary());
//! ```

mod engine;
mod metrics;

pub use engine::{SimulationEngine, SimulationResult};
pub use metrics::{SimulationMetrics, ValuePoint};
