//! Linear-backoff retry policy for transient and application failures.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt number and
//! the error class. The running count lives in a [`BurstCounter`] owned
//! by whoever is retrying; a successful exchange resets it, so the limit
//! applies to each burst of consecutive failures rather than to the whole
//! job.

use std::time::Duration;

use soulgen_dashscope::backend::BackendError;

/// Failure classes with independent retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection reset, timeout, DNS failure: the exchange never completed.
    Network,
    /// The service answered, but with a non-2xx status or a malformed body.
    Application,
}

impl ErrorClass {
    /// Classify a backend error.
    pub fn of(err: &BackendError) -> Self {
        if err.is_transient() {
            Self::Network
        } else {
            Self::Application
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the given delay, then try again.
    RetryAfter(Duration),
    /// The burst limit is exceeded.
    GiveUp,
}

/// Tunable retry parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive network failures tolerated per burst.
    pub max_network_attempts: u32,
    /// Consecutive application failures tolerated per burst.
    pub max_application_attempts: u32,
    /// Delay added per attempt (`step * attempt`).
    pub step: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_network_attempts: 5,
            max_application_attempts: 5,
            step: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after the `attempt`-th consecutive failure of
    /// `class` (1-based).
    ///
    /// Returns [`RetryDecision::GiveUp`] once `attempt` exceeds the class
    /// maximum, otherwise a delay of `min(step * attempt, max_delay)`.
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if attempt > self.max_attempts(class) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_for(attempt))
        }
    }

    /// Maximum retries per burst for `class`.
    pub fn max_attempts(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Network => self.max_network_attempts,
            ErrorClass::Application => self.max_application_attempts,
        }
    }

    /// Linear delay for `attempt`, clamped to [`RetryPolicy::max_delay`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}

/// Consecutive-failure counters, one per [`ErrorClass`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstCounter {
    network: u32,
    application: u32,
}

impl BurstCounter {
    /// Count one more failure of `class` and return the new burst length.
    pub fn record(&mut self, class: ErrorClass) -> u32 {
        let slot = match class {
            ErrorClass::Network => &mut self.network,
            ErrorClass::Application => &mut self.application,
        };
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Current burst length for `class`.
    pub fn current(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Network => self.network,
            ErrorClass::Application => self.application,
        }
    }

    /// Clear both counters after a successful exchange.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
