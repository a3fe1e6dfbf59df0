//! Simulated lending-pool backend.
//!
//! Supplied capital earns simple interest at a fixed APR, accrued lazily from
//! the clock on every call. Only the unlent part of the pool can be withdrawn:
//! with `utilization_bps = 8000`, at most 20% of the position is liquid at
//! any moment.

use super::{Amount, StrategyAdapter};
use crate::utils::decimal::{bps_of, BPS_DENOMINATOR};
use crate::utils::Clock;
use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const SECONDS_PER_YEAR: Amount = 365 * 24 * 60 * 60;

/// Parameters of a simulated lending pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingConfig {
    /// Supply APR in basis points
    pub apr_bps: u32,
    /// Share of the pool lent out and therefore not withdrawable
    pub utilization_bps: u32,
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            apr_bps: 500,
            utilization_bps: 0,
        }
    }
}

#[derive(Debug)]
struct LendingState {
    principal: Amount,
    accrued_interest: Amount,
    /// Interest numerator carried between accruals so short intervals are not lost
    carry: Amount,
    last_accrual: DateTime<Utc>,
}

/// Lending-pool strategy driven by an injected clock.
pub struct LendingStrategy {
    config: LendingConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LendingState>,
}

impl LendingStrategy {
    pub fn new(config: LendingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        ensure!(
            config.utilization_bps <= BPS_DENOMINATOR,
            "utilization_bps must be at most 10000"
        );
        let last_accrual = clock.now();
        Ok(Self {
            config,
            clock,
            state: Mutex::new(LendingState {
                principal: 0,
                accrued_interest: 0,
                carry: 0,
                last_accrual,
            }),
        })
    }

    pub fn config(&self) -> LendingConfig {
        self.config
    }

    /// Interest accrued and not yet harvested.
    pub async fn accrued_interest(&self) -> Amount {
        let mut state = self.state.lock().await;
        self.accrue(&mut state);
        state.accrued_interest
    }

    fn accrue(&self, state: &mut LendingState) {
        let now = self.clock.now();
        let elapsed = (now - state.last_accrual).num_seconds();
        if elapsed <= 0 {
            return;
        }
        let denominator = Amount::from(BPS_DENOMINATOR) * SECONDS_PER_YEAR;
        let numerator = state
            .principal
            .saturating_mul(Amount::from(self.config.apr_bps))
            .saturating_mul(elapsed as Amount)
            .saturating_add(state.carry);
        let interest = numerator / denominator;
        state.carry = numerator % denominator;
        state.accrued_interest += interest;
        state.last_accrual = now;

        if interest > 0 {
            debug!(%interest, elapsed_secs = elapsed, "Lending interest accrued");
        }
    }

    fn liquidity(&self, state: &LendingState) -> Amount {
        let value = state.principal + state.accrued_interest;
        bps_of(value, BPS_DENOMINATOR - self.config.utilization_bps)
    }
}

#[async_trait]
impl StrategyAdapter for LendingStrategy {
    async fn allocate(&self, amount: Amount) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.accrue(&mut state);
        state.principal += amount;
        Ok(true)
    }

    async fn withdraw(&self, amount: Amount) -> Result<Amount> {
        let mut state = self.state.lock().await;
        self.accrue(&mut state);

        let actual = amount.min(self.liquidity(&state));

        // Interest leaves first, then principal.
        let from_interest = actual.min(state.accrued_interest);
        state.accrued_interest -= from_interest;
        state.principal -= actual - from_interest;

        debug!(requested = %amount, %actual, "Lending withdrawal");
        Ok(actual)
    }

    async fn valuation(&self) -> Result<Amount> {
        let mut state = self.state.lock().await;
        self.accrue(&mut state);
        Ok(state.principal + state.accrued_interest)
    }

    async fn harvest_yield(&self) -> Result<Amount> {
        let mut state = self.state.lock().await;
        self.accrue(&mut state);
        let harvested = state.accrued_interest.min(self.liquidity(&state));
        state.accrued_interest -= harvested;
        Ok(harvested)
    }
}
