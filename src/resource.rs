//! The retry engine at the heart of every recovering connection and channel.
//!
//! A [`RetryableResource`] intercepts outbound operations on a wrapped
//! connection or channel, applies a bounded [`RetryPolicy`], arbitrates with
//! the recovery [`Circuit`] while a replacement transport is being rebuilt,
//! and replays declared topology against a freshly obtained channel.
//!
//! All retry logic lives in [`RetryableResource::call_with_retries`]; the
//! façades delegate every operation to it so the behaviour stays in a
//! single place.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::circuit::{Circuit, GateWait};
use crate::client::{Channel, ShutdownListener};
use crate::error::{MuninError, Result, ShutdownSignal};
use crate::policy::RetryPolicy;
use crate::stats::RetryStats;
use crate::telemetry;
use crate::topology::{Binding, ExchangeSpec, QueueSpec};
use crate::waiter::Waiter;

/// Capabilities a façade provides to the engine.
///
/// The connection and channel façades differ only here: where a recovery
/// channel comes from, whether a failed topology item poisons the recovery
/// pass, and what happens after the resource closes.
#[async_trait]
pub trait RecoverySupport: Send + Sync {
    /// A working channel to replay declarations on. For a connection this is
    /// a dedicated channel opened on the replacement transport; for a
    /// channel it is the already recovered delegate itself.
    async fn recovery_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Whether a failed topology item re-raises instead of being skipped.
    /// Channels say yes (their topology must be whole before callers
    /// resume); connections say no (a lost exchange is logged and skipped).
    fn throw_on_recovery_failure(&self) -> bool;

    /// Hook run once when the resource latches closed.
    fn after_closure(&self) {}
}

/// Retry engine state for one wrapped connection or channel.
pub struct RetryableResource {
    closed: AtomicBool,
    circuit: Circuit,
    retry_waiter: Waiter,
    listeners: Mutex<Vec<Arc<dyn ShutdownListener>>>,
}

impl Default for RetryableResource {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryableResource {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            circuit: Circuit::new(),
            retry_waiter: Waiter::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Whether close/abort has latched.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The gate the supervisor closes while rebuilding the transport.
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// The sleep primitive used between attempts; exposed so a supervisor
    /// can pace its own recovery passes with the same interruptible wait.
    pub fn retry_waiter(&self) -> &Waiter {
        &self.retry_waiter
    }

    /// Latch the resource closed, run the closure hook, and wake every
    /// blocked caller so it can propagate. Idempotent.
    pub fn mark_closed(&self, support: &dyn RecoverySupport) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            support.after_closure();
        }
        self.circuit.interrupt_waiters();
        self.retry_waiter.interrupt_waiters();
    }

    /// Register an application shutdown listener.
    ///
    /// The list lives on the façade, never the underlying transport, so
    /// registration survives reconnection without replay against the broker
    /// client.
    pub fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.lock().push(listener);
    }

    /// Remove a previously registered listener (by identity).
    pub fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) {
        self.listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Notify every registered listener of an observed shutdown.
    pub fn notify_listeners(&self, signal: &ShutdownSignal) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_shutdown(signal);
        }
    }

    /// Execute `operation` with retries under `policy`.
    ///
    /// `recovery_stats: Some(_)` marks this invocation as running inside a
    /// recovery pass: attempts draw on the shared budget and transport
    /// shutdowns propagate to the supervisor instead of parking here.
    /// `recoverable` says whether this resource's recovery should absorb a
    /// transport loss at all; when false, shutdowns propagate unchanged.
    ///
    /// On failure the error surfaced is always the one the operation
    /// produced; retry bookkeeping never substitutes its own.
    pub async fn call_with_retries<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
        policy: &RetryPolicy,
        mut recovery_stats: Option<&mut RetryStats>,
        recoverable: bool,
        log_failures: bool,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_closed() {
            return Err(MuninError::Closed);
        }
        let in_recovery = recovery_stats.is_some();
        let mut local_stats: Option<RetryStats> = None;

        loop {
            let attempt_started = Instant::now();
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let shutdown = error.shutdown_signal().is_some();
            if shutdown && (in_recovery || !recoverable) {
                return Err(error);
            }
            if self.is_closed() {
                return Err(error);
            }
            if !(policy.allows_attempts() && error.is_retryable(policy.retry_auth_failures)) {
                return Err(error);
            }

            let stats = match recovery_stats.as_deref_mut() {
                Some(shared) => shared,
                None => local_stats.get_or_insert_with(|| RetryStats::new(policy.clone())),
            };

            if shutdown {
                // Park until the supervisor has rebuilt the transport and
                // reopened the circuit. A bounded policy bounds the park.
                let outcome = self.circuit.wait_open(stats.max_wait_time()).await;
                match outcome {
                    GateWait::Opened => {}
                    GateWait::TimedOut | GateWait::Interrupted => return Err(error),
                }
                if self.is_closed() {
                    return Err(error);
                }
            }

            stats.increment_attempts();
            if stats.is_exceeded() {
                return Err(error);
            }

            metrics::counter!(telemetry::RETRIES_TOTAL, "operation" => operation_name.to_owned())
                .increment(1);
            let wait = stats.wait_time().saturating_sub(attempt_started.elapsed());
            if log_failures {
                warn!(
                    operation = operation_name,
                    attempt = stats.attempts(),
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
            }
            if !wait.is_zero() {
                self.retry_waiter.wait_for(wait).await;
                if self.is_closed() {
                    return Err(error);
                }
            }
        }
    }

    /// Replay an exchange declaration against the recovery channel.
    pub async fn recover_exchange(
        &self,
        support: &dyn RecoverySupport,
        spec: &ExchangeSpec,
    ) -> Result<()> {
        let channel = support.recovery_channel().await?;
        match channel.declare_exchange(spec).await {
            Ok(()) => Ok(()),
            Err(error) => self.recovery_failure("exchange", &spec.name, support, error),
        }
    }

    /// Replay exchange→exchange bindings, in insertion order. Items that
    /// fail without escalating are skipped, never removed.
    pub async fn recover_exchange_bindings(
        &self,
        support: &dyn RecoverySupport,
        bindings: &[Binding],
    ) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        let channel = support.recovery_channel().await?;
        for binding in bindings {
            let replayed = channel
                .bind_exchange(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    &binding.arguments,
                )
                .await;
            if let Err(error) = replayed {
                self.recovery_failure("exchange binding", &binding.destination, support, error)?;
            }
        }
        Ok(())
    }

    /// Replay a queue declaration, capturing the server-assigned name.
    ///
    /// Returns the effective name: the (possibly new) broker-assigned name
    /// on success, the original name on a swallowed failure. A changed name
    /// is written back into the spec so later bindings and consumers target
    /// the right queue.
    pub async fn recover_queue(
        &self,
        support: &dyn RecoverySupport,
        spec: &QueueSpec,
    ) -> Result<String> {
        let channel = support.recovery_channel().await?;
        let old_name = spec.name();
        match channel.declare_queue(spec).await {
            Ok(reply) => {
                if reply.queue != old_name {
                    warn!(old = %old_name, new = %reply.queue, "queue renamed during recovery");
                    spec.set_name(reply.queue.clone());
                }
                Ok(reply.queue)
            }
            Err(error) => {
                self.recovery_failure("queue", &old_name, support, error)?;
                Ok(old_name)
            }
        }
    }

    /// Replay queue bindings, in insertion order. Same per-item policy as
    /// [`Self::recover_exchange_bindings`].
    pub async fn recover_queue_bindings(
        &self,
        support: &dyn RecoverySupport,
        bindings: &[Binding],
    ) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        let channel = support.recovery_channel().await?;
        for binding in bindings {
            let replayed = channel
                .bind_queue(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    &binding.arguments,
                )
                .await;
            if let Err(error) = replayed {
                self.recovery_failure("queue binding", &binding.destination, support, error)?;
            }
        }
        Ok(())
    }

    /// Shared per-item recovery failure helper: log, then re-raise iff the
    /// façade demands it or the failure was itself a connection-level
    /// closure (the supervisor must restart the pass from the top).
    fn recovery_failure(
        &self,
        kind: &str,
        name: &str,
        support: &dyn RecoverySupport,
        error: MuninError,
    ) -> Result<()> {
        metrics::counter!(telemetry::RECOVERY_FAILURES_TOTAL).increment(1);
        error!(kind, name, error = %error, "failed to recover topology item");
        if support.throw_on_recovery_failure() || error.is_connection_shutdown() {
            Err(error)
        } else {
            Ok(())
        }
    }
}

/// Run recovery passes through the engine until one succeeds or the budget
/// is spent. Returns whether the resource recovered.
///
/// One `pass` is a whole rebuild: reconnect plus topology replay. The
/// engine retries transient errors inside the pass against the shared
/// stats; a transport shutdown mid-pass propagates here and restarts the
/// pass from the top, still against the same budget.
pub(crate) async fn drive_recovery<F, Fut>(
    resource: &RetryableResource,
    policy: &RetryPolicy,
    operation_name: &str,
    mut pass: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut stats = RetryStats::new(policy.clone());
    loop {
        let result = resource
            .call_with_retries(operation_name, &mut pass, policy, Some(&mut stats), true, true)
            .await;
        let error = match result {
            Ok(()) => return true,
            Err(error) => error,
        };
        if resource.is_closed() {
            return false;
        }
        let retryable = error.shutdown_signal().is_some()
            && policy.allows_attempts()
            && error.is_retryable(policy.retry_auth_failures);
        if !retryable {
            error!(operation = operation_name, error = %error, "recovery failed");
            return false;
        }
        stats.increment_attempts();
        if stats.is_exceeded() {
            warn!(operation = operation_name, attempts = stats.attempts(), "recovery budget spent");
            return false;
        }
        let wait = stats.wait_time();
        if !wait.is_zero() {
            resource.retry_waiter.wait_for(wait).await;
            if resource.is_closed() {
                return false;
            }
        }
    }
}
