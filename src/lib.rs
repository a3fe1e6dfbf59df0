//! # Capital Rebalancer
//!
//! Keeps a pool of capital spread across heterogeneous strategy backends
//! according to administrator-defined basis-point weights.
//!
//! ## Architecture
//!
//! - `adapter`: Strategy backend capability (allocate, withdraw, value, harvest)
//! - `portfolio`: Target registry, valuation, gating, and the rebalance engine
//! - `config`: Configuration management and validation
//! - `persistence`: SQLite-based snapshot and rebalance history storage
//! - `simulation`: Paper-trading runs on a simulated clock
//! - `utils`: Clocks and basis-point arithmetic

pub mod adapter;
pub mod config;
pub mod error;
pub mod persistence;
pub mod portfolio;
pub mod simulation;
pub mod utils;

pub use config::Config;
pub use error::{PortfolioError, PortfolioResult};
pub use portfolio::Portfolio;
