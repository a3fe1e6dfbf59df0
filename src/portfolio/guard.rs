//! Non-reentrant execution guard.
//!
//! A single busy flag covers every operation that moves capital or changes
//! the weight basis. Entry is a compare-and-swap: a second entry while the
//! flag is set fails immediately instead of waiting, which is what turns an
//! adapter calling back into the portfolio into a deterministic error rather
//! than a deadlock or a nested rebalance.

use crate::error::{PortfolioError, PortfolioResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    busy: AtomicBool,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the guard for `operation`.
    ///
    /// The returned token releases the guard when dropped, on every exit path.
    pub fn enter(&self, operation: &'static str) -> PortfolioResult<GuardToken<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(operation, "Rejected reentrant call");
            return Err(PortfolioError::Reentrant { operation });
        }
        trace!(operation, "Guard acquired");
        Ok(GuardToken {
            guard: self,
            operation,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of exclusive access; releases the guard on drop.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a ConcurrencyGuard,
    operation: &'static str,
}

impl GuardToken<'_> {
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
        trace!(operation = self.operation, "Guard released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_entry_is_rejected() {
        let guard = ConcurrencyGuard::new();
        let token = guard.enter("rebalance").unwrap();
        assert_eq!(token.operation(), "rebalance");

        let err = guard.enter("deposit").unwrap_err();
        assert_eq!(err, PortfolioError::Reentrant { operation: "deposit" });
        assert!(guard.is_busy());
    }

    #[test]
    fn test_release_on_drop() {
        let guard = ConcurrencyGuard::new();
        {
            let _token = guard.enter("rebalance").unwrap();
        }
        assert!(!guard.is_busy());
        assert!(guard.enter("rebalance").is_ok());
    }

    #[test]
    fn test_release_on_error_path() {
        fn failing(guard: &ConcurrencyGuard) -> PortfolioResult<()> {
            let _token = guard.enter("add_target")?;
            Err(PortfolioError::InvalidAddress)
        }

        let guard = ConcurrencyGuard::new();
        assert!(failing(&guard).is_err());
        assert!(!guard.is_busy());
    }
}
