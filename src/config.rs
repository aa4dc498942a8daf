//! Policy configuration for recovering connections and channels.
//!
//! A [`Config`] bundles the three budgets a recovering connection runs on —
//! bootstrap, per-operation retry, transport recovery — plus the switch
//! that turns recovery off entirely:
//!
//! ```rust
//! # use munin::{Config, RetryPolicy};
//! # use std::time::Duration;
//! let config = Config::new()
//!     .retry_policy(RetryPolicy::new().max_attempts(5).interval(Duration::from_millis(200)))
//!     .recovery_policy(
//!         RetryPolicy::new()
//!             .interval(Duration::from_secs(1))
//!             .backoff_factor(2.0)
//!             .max_interval(Duration::from_secs(30)),
//!     );
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::RetryPolicy;

/// Policy bundle for a recovering connection and its channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Budget for the bootstrap connection attempt.
    pub connect_policy: RetryPolicy,
    /// Budget for each intercepted outbound operation.
    pub retry_policy: RetryPolicy,
    /// Budget for a whole transport recovery pass (shared across every step
    /// of the pass).
    pub recovery_policy: RetryPolicy,
    /// When false, transport shutdowns propagate to callers unchanged and
    /// no supervisor runs.
    pub recovery_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_policy: RetryPolicy::new()
                .max_attempts(3)
                .interval(Duration::from_millis(500))
                .backoff_factor(2.0),
            retry_policy: RetryPolicy::new()
                .max_attempts(3)
                .interval(Duration::from_millis(500))
                .backoff_factor(2.0)
                .max_interval(Duration::from_secs(30)),
            recovery_policy: RetryPolicy::new()
                .interval(Duration::from_secs(1))
                .backoff_factor(2.0)
                .max_interval(Duration::from_secs(30)),
            recovery_enabled: true,
        }
    }
}

impl Config {
    /// Create a config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bootstrap connection budget.
    pub fn connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    /// Set the per-operation retry budget.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the transport recovery budget.
    pub fn recovery_policy(mut self, policy: RetryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Enable or disable transport recovery.
    pub fn recovery_enabled(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_recovery() {
        let config = Config::default();
        assert!(config.recovery_enabled);
        assert!(config.recovery_policy.max_attempts.is_none());
        assert_eq!(config.retry_policy.max_attempts, Some(3));
    }

    #[test]
    fn builder_overrides() {
        let config = Config::new()
            .recovery_enabled(false)
            .retry_policy(RetryPolicy::never());
        assert!(!config.recovery_enabled);
        assert!(!config.retry_policy.allows_attempts());
    }
}
