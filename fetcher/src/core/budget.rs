//! Session time budget and cooperative cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared flag a caller flips to stop a running session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why no budget is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    TimedOut,
    Cancelled,
}

impl fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExhausted::TimedOut => f.write_str("session timed out"),
            BudgetExhausted::Cancelled => f.write_str("session cancelled"),
        }
    }
}

/// Wall-clock deadline plus cancel flag for one session.
#[derive(Debug, Clone)]
pub struct Deadline {
    /// `None` when the budget is too large to represent as an instant.
    at: Option<Instant>,
    cancel: CancelToken,
}

impl Deadline {
    pub fn after(budget: Duration, cancel: CancelToken) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Time left, or why there is none.
    pub fn remaining(&self) -> Result<Duration, BudgetExhausted> {
        if self.cancel.is_cancelled() {
            return Err(BudgetExhausted::Cancelled);
        }
        let Some(at) = self.at else {
            return Ok(Duration::MAX);
        };
        let remaining = at
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Err(BudgetExhausted::TimedOut);
        }
        Ok(remaining)
    }

    /// `limit` clipped to the remaining budget.
    pub fn clip(&self, limit: Duration) -> Result<Duration, BudgetExhausted> {
        Ok(self.remaining()?.min(limit))
    }
}
