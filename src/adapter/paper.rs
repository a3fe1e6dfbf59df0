//! Paper strategy backend for simulation and testing.

use super::{Amount, StrategyAdapter};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Simulated custody state of a paper strategy.
#[derive(Debug, Clone, Default)]
pub struct PaperStrategyState {
    /// Value currently held (principal plus unrealized mark-to-market)
    pub balance: Amount,
    /// Yield accrued but not yet harvested (not part of `balance`)
    pub pending_yield: Amount,
    /// Whether `allocate` accepts capital
    pub accepts_allocations: bool,
    /// Maximum amount returned per `withdraw` call (liquidity constraint)
    pub withdraw_cap: Option<Amount>,
    /// Inject failures into `valuation`
    pub fail_valuation: bool,
    /// Inject failures into `withdraw`
    pub fail_withdraw: bool,
    pub allocation_count: u64,
    pub withdrawal_count: u64,
    pub total_allocated: Amount,
    pub total_withdrawn: Amount,
}

/// Paper backend whose behavior is fully scripted by the caller.
///
/// Clones share state, so a test can keep a handle while the portfolio owns
/// another one.
#[derive(Debug, Clone)]
pub struct PaperStrategy {
    state: Arc<RwLock<PaperStrategyState>>,
}

impl PaperStrategy {
    /// Create an empty paper strategy that accepts every allocation.
    pub fn new() -> Self {
        Self::with_balance(0)
    }

    /// Create a paper strategy already holding `balance`.
    pub fn with_balance(balance: Amount) -> Self {
        let state = PaperStrategyState {
            balance,
            accepts_allocations: true,
            ..PaperStrategyState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn set_accepts_allocations(&self, accepts: bool) {
        self.state.write().await.accepts_allocations = accepts;
    }

    pub async fn set_withdraw_cap(&self, cap: Option<Amount>) {
        self.state.write().await.withdraw_cap = cap;
    }

    pub async fn set_fail_valuation(&self, fail: bool) {
        self.state.write().await.fail_valuation = fail;
    }

    pub async fn set_fail_withdraw(&self, fail: bool) {
        self.state.write().await.fail_withdraw = fail;
    }

    /// Accrue yield that `harvest_yield` will later realize.
    pub async fn accrue_yield(&self, amount: Amount) {
        self.state.write().await.pending_yield += amount;
    }

    /// Mark the position to market by `bps` (negative for a loss).
    ///
    /// Losses saturate at zero.
    pub async fn apply_return_bps(&self, bps: i32) {
        let mut state = self.state.write().await;
        let change = state.balance * Amount::from(bps.unsigned_abs()) / 10_000;
        state.balance = if bps >= 0 {
            state.balance + change
        } else {
            state.balance.saturating_sub(change)
        };
        debug!(bps, balance = %state.balance, "Paper strategy marked to market");
    }

    /// Get a copy of the current state.
    pub async fn get_state(&self) -> PaperStrategyState {
        self.state.read().await.clone()
    }

    /// Current balance, bypassing failure injection.
    pub async fn balance(&self) -> Amount {
        self.state.read().await.balance
    }
}

impl Default for PaperStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyAdapter for PaperStrategy {
    async fn allocate(&self, amount: Amount) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.accepts_allocations {
            debug!(%amount, "Paper strategy rejected allocation");
            return Ok(false);
        }
        state.balance += amount;
        state.total_allocated += amount;
        state.allocation_count += 1;
        Ok(true)
    }

    async fn withdraw(&self, amount: Amount) -> Result<Amount> {
        let mut state = self.state.write().await;
        if state.fail_withdraw {
            bail!("paper strategy withdrawal failure");
        }
        let mut actual = amount.min(state.balance);
        if let Some(cap) = state.withdraw_cap {
            actual = actual.min(cap);
        }
        state.balance -= actual;
        state.total_withdrawn += actual;
        state.withdrawal_count += 1;
        Ok(actual)
    }

    async fn valuation(&self) -> Result<Amount> {
        let state = self.state.read().await;
        if state.fail_valuation {
            bail!("paper strategy valuation unavailable");
        }
        Ok(state.balance)
    }

    async fn harvest_yield(&self) -> Result<Amount> {
        let mut state = self.state.write().await;
        let harvested = std::mem::take(&mut state.pending_yield);
        Ok(harvested)
    }
}
