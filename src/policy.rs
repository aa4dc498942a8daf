//! Retry and recovery budget descriptions.
//!
//! A [`RetryPolicy`] is an immutable description of how often and for how
//! long an operation may be retried: attempt cap, wall-clock cap, backoff
//! growth, interval cap, jitter, and whether authentication failures are
//! worth retrying. The same type drives both per-operation retries and
//! whole-transport recovery; only the budgets differ.
//!
//! ```rust
//! # use munin::RetryPolicy;
//! # use std::time::Duration;
//! let policy = RetryPolicy::new()
//!     .max_attempts(5)
//!     .interval(Duration::from_millis(200))
//!     .backoff_factor(2.0)
//!     .max_interval(Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Budget description for retries and recovery.
///
/// An all-defaults policy allows attempts indefinitely: no attempt cap, no
/// duration cap, immediate retry. Use [`RetryPolicy::never()`] to disable
/// retries entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts. `None` = unbounded. `Some(0)` disables
    /// retries.
    pub max_attempts: Option<u32>,
    /// Maximum total wall-clock time for one invocation. `None` = unbounded.
    pub max_duration: Option<Duration>,
    /// Wait before the first retry. Zero is legal and retries immediately.
    pub interval: Duration,
    /// Multiplier applied to the interval after each failed attempt. Always
    /// at least 1.0.
    pub backoff_factor: f64,
    /// Cap on interval growth. `None` = uncapped.
    pub max_interval: Option<Duration>,
    /// Fraction (0.0..=1.0) by which each wait may be randomly reduced.
    pub jitter: f64,
    /// Whether authentication failures count as retryable. Default: false.
    pub retry_auth_failures: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_duration: None,
            interval: Duration::ZERO,
            backoff_factor: 1.0,
            max_interval: None,
            jitter: 0.0,
            retry_auth_failures: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that retries indefinitely with no wait.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy that disables retries (single attempt).
    pub fn never() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Set the maximum total wall-clock time for one invocation.
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Set the wait before the first retry.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the backoff multiplier. Values below 1.0 are clamped to 1.0.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor < 1.0 { 1.0 } else { factor };
        self
    }

    /// Cap interval growth.
    pub fn max_interval(mut self, cap: Duration) -> Self {
        self.max_interval = Some(cap);
        self
    }

    /// Set the jitter fraction, clamped to 0.0..=1.0.
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Opt in to retrying authentication failures.
    pub fn retry_auth_failures(mut self, enabled: bool) -> Self {
        self.retry_auth_failures = enabled;
        self
    }

    /// True unless the policy was explicitly configured as "no retries".
    ///
    /// An unbounded policy still allows attempts in the attempt dimension.
    pub fn allows_attempts(&self) -> bool {
        self.max_attempts != Some(0)
    }
}
