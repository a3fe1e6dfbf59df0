//! Error types for portfolio operations.
//!
//! Registry, gating and parameter errors are atomic rejections: the portfolio
//! is left exactly as it was before the call. Adapter faults never appear here,
//! they are absorbed by the engine and reported through `RebalanceReport`.

use crate::adapter::Amount;
use thiserror::Error;

/// Errors surfaced by the portfolio's administrative and boundary operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortfolioError {
    /// Target identifier is empty (the "zero address" of this engine).
    #[error("invalid target address: identifier must not be empty")]
    InvalidAddress,

    /// Weight is zero or above 10000 bps.
    #[error("invalid weight {weight_bps} bps (must be within 1..=10000)")]
    InvalidWeight { weight_bps: u32 },

    #[error("target {id} is already registered")]
    DuplicateTarget { id: String },

    #[error("target {id} not found")]
    NotFound { id: String },

    /// The weight sum of active targets would exceed 10000 bps.
    #[error("weight sum would be {resulting_bps} bps (current {current_total_bps}, max 10000)")]
    WeightExceeded {
        current_total_bps: u32,
        resulting_bps: u32,
    },

    #[error("principal {principal} is not an administrator")]
    Unauthorized { principal: String },

    /// Rebalance called while neither the interval has elapsed nor drift exceeds threshold.
    #[error("rebalance not due: {elapsed_secs}s elapsed of {interval_secs}s interval, drift below threshold")]
    TooEarly {
        elapsed_secs: u64,
        interval_secs: u64,
    },

    /// Another guarded operation is in progress (typically an adapter calling back in).
    #[error("reentrant call rejected: {operation} attempted while the portfolio is busy")]
    Reentrant { operation: &'static str },

    #[error("invalid rebalance interval {seconds}s (max {max}s)")]
    InvalidInterval { seconds: u64, max: u64 },

    #[error("invalid rebalance threshold {bps} bps (max 10000)")]
    InvalidThreshold { bps: u32 },

    #[error("invalid amount {amount}")]
    InvalidAmount { amount: Amount },

    /// The target's backend could not report its value, so it cannot be drained safely.
    #[error("valuation of target {id} is unavailable")]
    ValuationUnavailable { id: String },

    /// Removing the last administrator would lock the portfolio.
    #[error("cannot revoke the last administrator {principal}")]
    LastAdministrator { principal: String },
}

pub type PortfolioResult<T> = std::result::Result<T, PortfolioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = PortfolioError::WeightExceeded {
            current_total_bps: 10000,
            resulting_bps: 15000,
        };
        assert_eq!(
            err.to_string(),
            "weight sum would be 15000 bps (current 10000, max 10000)"
        );

        let err = PortfolioError::Reentrant {
            operation: "rebalance",
        };
        assert!(err.to_string().contains("rebalance"));
    }
}
