//! Telemetry metric name constants.
//!
//! Centralised metric names for munin operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! All metrics are prefixed with `munin_` and counters end in `_total`.
//!
//! # Common labels
//!
//! - `operation` — the intercepted operation (e.g. "publish",
//!   "queue.declare", "recovery")
//! - `scope` — "connection" or "channel"

/// Total retry attempts (not counting the initial invocation).
///
/// Labels: `operation`.
pub const RETRIES_TOTAL: &str = "munin_retries_total";

/// Total recovery passes started after an observed transport shutdown.
///
/// Labels: `scope`.
pub const RECOVERIES_TOTAL: &str = "munin_recoveries_total";

/// Total topology items that failed to recover and were skipped or
/// escalated.
///
/// Labels: `scope`.
pub const RECOVERY_FAILURES_TOTAL: &str = "munin_recovery_failures_total";

/// Total resources (connections and channels) closed because a recovery
/// budget was spent or an escalating error made recovery hopeless.
///
/// Labels: `scope`.
pub const ABANDONED_TOTAL: &str = "munin_abandoned_total";
