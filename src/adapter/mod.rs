//! Strategy backends that hold the portfolio's allocated capital.
//!
//! Every backend implements [`StrategyAdapter`], a uniform capability surface
//! the engine drives without knowing what sits behind it:
//! - `PaperStrategy`: configurable simulated backend for paper runs and tests
//! - `LendingStrategy`: simulated lending pool with interest accrual and
//!   utilization-limited withdrawals

mod lending;
mod paper;

pub use lending::{LendingConfig, LendingStrategy};
pub use paper::{PaperStrategy, PaperStrategyState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value in the portfolio's base unit (smallest indivisible unit of the base asset).
pub type Amount = u128;

/// Kind of backend, used for configuration and display only.
///
/// The engine never branches on this: it dispatches through the trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Paper,
    Lending,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Paper => write!(f, "Paper"),
            AdapterKind::Lending => write!(f, "Lending"),
        }
    }
}

impl AdapterKind {
    /// Short code for display (2-3 chars).
    pub fn short_code(&self) -> &'static str {
        match self {
            AdapterKind::Paper => "PPR",
            AdapterKind::Lending => "LND",
        }
    }
}

/// Capability surface implemented by each pluggable backend.
///
/// Implementations are untrusted from the engine's point of view: any call may
/// fail, under-deliver, or try to call back into the portfolio. Errors are
/// reported as `anyhow::Error` and absorbed by the engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StrategyAdapter: Send + Sync {
    /// Attempt to take custody of `amount`. Returns whether it was accepted.
    async fn allocate(&self, amount: Amount) -> anyhow::Result<bool>;

    /// Attempt to return up to `amount`. Returns the amount actually returned.
    async fn withdraw(&self, amount: Amount) -> anyhow::Result<Amount>;

    /// Current value held by this backend, in the portfolio's base unit.
    async fn valuation(&self) -> anyhow::Result<Amount>;

    /// Realize accrued yield back to the portfolio. Returns the amount realized.
    async fn harvest_yield(&self) -> anyhow::Result<Amount> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_display() {
        assert_eq!(AdapterKind::Paper.to_string(), "Paper");
        assert_eq!(AdapterKind::Lending.short_code(), "LND");
    }

    #[test]
    fn test_adapter_kind_deserializes_snake_case() {
        let kind: AdapterKind = serde_json::from_str("\"lending\"").unwrap();
        assert_eq!(kind, AdapterKind::Lending);
    }

    #[test]
    fn test_default_harvest_yields_nothing() {
        use std::sync::Arc;

        struct Idle;

        #[async_trait]
        impl StrategyAdapter for Idle {
            async fn allocate(&self, _amount: Amount) -> anyhow::Result<bool> {
                Ok(false)
            }

            async fn withdraw(&self, _amount: Amount) -> anyhow::Result<Amount> {
                Ok(0)
            }

            async fn valuation(&self) -> anyhow::Result<Amount> {
                Ok(0)
            }
        }

        let adapter: Arc<dyn StrategyAdapter> = Arc::new(Idle);
        assert_eq!(tokio_test::block_on(adapter.harvest_yield()).unwrap(), 0);
        assert!(!tokio_test::block_on(adapter.allocate(10)).unwrap());
    }
}
