//! Error budget for a single connection
//!
//! A one-way circuit breaker with two states:
//! - Closed: calls are allowed, failures are counted
//! - Open: the failure count reached the maximum, every call is rejected
//!
//! There is no half-open state. The automation server keeps state that cannot
//! be trusted after repeated failures, so an open circuit stays open until the
//! connection is torn down and a new one is created.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Circuit states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are allowed
    Closed {
        /// Failures recorded so far
        failure_count: u32,
    },

    /// Failure budget exhausted, calls are rejected without reaching the server
    Open,
}

impl CircuitState {
    pub fn is_request_allowed(&self) -> bool {
        matches!(self, CircuitState::Closed { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed { .. } => "Closed",
            CircuitState::Open => "Open",
        }
    }
}

/// Bounded failure counter
///
/// The count never exceeds `max_failures`. Mutations happen under the owning
/// connection's lock; reads are lock-free.
#[derive(Debug)]
pub struct ErrorBudget {
    failures: AtomicU32,
    max_failures: u32,
}

impl ErrorBudget {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            max_failures,
        }
    }

    /// Reject the call if the budget is exhausted
    pub fn check_request(&self) -> Result<()> {
        let count = self.count();
        if count >= self.max_failures {
            debug!(count, "Rejecting call, error budget exhausted");
            return Err(Error::TooManyErrors { count });
        }
        Ok(())
    }

    /// Record a failure and return the new count
    pub fn record_failure(&self) -> u32 {
        let max = self.max_failures;
        let previous = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .unwrap_or(max);
        let count = (previous + 1).min(max);

        if count >= max && previous < max {
            error!(count, max, "Error budget exhausted, circuit is now open");
        } else {
            warn!(count, max, "Recorded connection failure");
        }

        count
    }

    pub fn count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn state(&self) -> CircuitState {
        let failure_count = self.count();
        if failure_count >= self.max_failures {
            CircuitState::Open
        } else {
            CircuitState::Closed { failure_count }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_closed_to_open() {
        let budget = ErrorBudget::new(3);
        assert!(budget.check_request().is_ok());
        assert_eq!(budget.state(), CircuitState::Closed { failure_count: 0 });

        assert_eq!(budget.record_failure(), 1);
        assert_eq!(budget.record_failure(), 2);
        assert!(budget.check_request().is_ok());
        assert_eq!(budget.record_failure(), 3);

        assert_eq!(budget.state(), CircuitState::Open);
        assert!(matches!(budget.check_request(), Err(Error::TooManyErrors { count: 3 })));
    }

    #[test]
    fn test_count_never_exceeds_max() {
        let budget = ErrorBudget::new(2);
        for _ in 0..5 {
            budget.record_failure();
        }
        assert_eq!(budget.count(), 2);
    }

    #[test]
    fn test_zero_budget_rejects_immediately() {
        let budget = ErrorBudget::new(0);
        assert!(!budget.state().is_request_allowed());
        assert!(budget.check_request().is_err());
    }

    #[test]
    fn test_circuit_state_names() {
        assert_eq!(CircuitState::Closed { failure_count: 1 }.name(), "Closed");
        assert_eq!(CircuitState::Open.name(), "Open");
    }
}
