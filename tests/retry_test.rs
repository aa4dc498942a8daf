use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use munin::resource::{RecoverySupport, RetryableResource};
use munin::{Channel, GateWait, MuninError, Result, RetryPolicy, RetryStats, ShutdownSignal};

/// Support stub for engine-level tests; no recovery channel involved.
struct NoopSupport;

#[async_trait]
impl RecoverySupport for NoopSupport {
    async fn recovery_channel(&self) -> Result<Arc<dyn Channel>> {
        Err(MuninError::Closed)
    }

    fn throw_on_recovery_failure(&self) -> bool {
        false
    }
}

/// Operation that fails N times then succeeds, counting every call.
struct FailThenSucceed {
    fail_count: AtomicU32,
    fail_with: fn() -> MuninError,
    total_calls: AtomicU32,
}

impl FailThenSucceed {
    fn new(failures: u32, fail_with: fn() -> MuninError) -> Self {
        Self {
            fail_count: AtomicU32::new(failures),
            fail_with,
            total_calls: AtomicU32::new(0),
        }
    }

    fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::Relaxed)
    }

    async fn invoke(&self, value: u32) -> Result<u32> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let remaining = self.fail_count.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::Relaxed);
            return Err((self.fail_with)());
        }
        Ok(value)
    }
}

fn io_error() -> MuninError {
    MuninError::Io("connection reset".into())
}

fn connection_shutdown() -> MuninError {
    MuninError::Shutdown(ShutdownSignal::connection(320, "broker restart"))
}

#[tokio::test]
async fn retries_io_error_then_succeeds() {
    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(1, io_error);
    let policy = RetryPolicy::new()
        .max_attempts(3)
        .interval(Duration::from_millis(10));

    let start = Instant::now();
    let result = resource
        .call_with_retries("test", || operation.invoke(42), &policy, None, true, false)
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(operation.call_count(), 2);
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(u32::MAX, io_error);
    let policy = RetryPolicy::new()
        .max_attempts(3)
        .interval(Duration::from_millis(1));

    let result = resource
        .call_with_retries("test", || operation.invoke(42), &policy, None, true, false)
        .await;

    assert!(matches!(result, Err(MuninError::Io(_))));
    assert_eq!(operation.call_count(), 3);
}

#[tokio::test]
async fn does_not_retry_application_errors() {
    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(1, || MuninError::InvalidOperation("bad type".into()));
    let policy = RetryPolicy::new().max_attempts(5);

    let result = resource
        .call_with_retries("test", || operation.invoke(42), &policy, None, true, false)
        .await;

    assert!(matches!(result, Err(MuninError::InvalidOperation(_))));
    assert_eq!(operation.call_count(), 1);
}

#[tokio::test]
async fn auth_failures_retry_only_by_opt_in() {
    let policy = RetryPolicy::new()
        .max_attempts(3)
        .interval(Duration::from_millis(1));

    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(1, || MuninError::Authentication("bad creds".into()));
    let result = resource
        .call_with_retries("test", || operation.invoke(1), &policy, None, true, false)
        .await;
    assert!(result.is_err());
    assert_eq!(operation.call_count(), 1);

    let operation = FailThenSucceed::new(1, || MuninError::Authentication("bad creds".into()));
    let result = resource
        .call_with_retries(
            "test",
            || operation.invoke(1),
            &policy.clone().retry_auth_failures(true),
            None,
            true,
            false,
        )
        .await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(operation.call_count(), 2);
}

#[tokio::test]
async fn never_policy_propagates_first_failure() {
    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(1, io_error);

    let result = resource
        .call_with_retries(
            "test",
            || operation.invoke(42),
            &RetryPolicy::never(),
            None,
            true,
            false,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(operation.call_count(), 1);
}

#[tokio::test]
async fn shutdown_waits_for_circuit_then_retries() {
    let resource = Arc::new(RetryableResource::new());

    // Close the circuit from another task so this test's task is not the
    // owner and a waiter genuinely parks.
    {
        let resource = Arc::clone(&resource);
        tokio::spawn(async move { resource.circuit().close() })
            .await
            .unwrap();
    }
    assert!(resource.circuit().is_closed());

    let opened_at = Arc::new(std::sync::Mutex::new(None));
    {
        let resource = Arc::clone(&resource);
        let opened_at = Arc::clone(&opened_at);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            *opened_at.lock().unwrap() = Some(Instant::now());
            resource.circuit().open();
        });
    }

    let operation = FailThenSucceed::new(1, connection_shutdown);
    let policy = RetryPolicy::new().max_attempts(5);
    let result = resource
        .call_with_retries("test", || operation.invoke(7), &policy, None, true, false)
        .await;
    let finished_at = Instant::now();

    assert_eq!(result.unwrap(), 7);
    assert_eq!(operation.call_count(), 2);
    let opened_at = opened_at.lock().unwrap().expect("circuit was opened");
    assert!(finished_at >= opened_at);
}

#[tokio::test]
async fn max_duration_exceeded_reraises_original_error() {
    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(u32::MAX, io_error);
    let policy = RetryPolicy::new()
        .max_duration(Duration::from_millis(20))
        .interval(Duration::from_millis(5));

    let start = Instant::now();
    let result = resource
        .call_with_retries("test", || operation.invoke(42), &policy, None, true, false)
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(MuninError::Io(_))));
    assert!(operation.call_count() >= 2);
    // Budget plus at most one trailing wait.
    assert!(elapsed < Duration::from_millis(200));
}

#[tokio::test]
async fn close_during_circuit_wait_interrupts() {
    let resource = Arc::new(RetryableResource::new());
    {
        let resource = Arc::clone(&resource);
        tokio::spawn(async move { resource.circuit().close() })
            .await
            .unwrap();
    }

    let operation = Arc::new(FailThenSucceed::new(u32::MAX, connection_shutdown));
    let engine = {
        let resource = Arc::clone(&resource);
        let operation = Arc::clone(&operation);
        tokio::spawn(async move {
            resource
                .call_with_retries(
                    "test",
                    || {
                        let operation = Arc::clone(&operation);
                        async move { operation.invoke(42).await }
                    },
                    &RetryPolicy::new(),
                    None,
                    true,
                    false,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!engine.is_finished());
    resource.mark_closed(&NoopSupport);

    let result = engine.await.unwrap();
    assert!(matches!(result, Err(MuninError::Shutdown(_))));
    // The circuit never opened, so the operation never ran a second time.
    assert_eq!(operation.call_count(), 1);
}

#[tokio::test]
async fn closed_resource_rejects_new_work() {
    let resource = RetryableResource::new();
    resource.mark_closed(&NoopSupport);

    let operation = FailThenSucceed::new(0, io_error);
    let result = resource
        .call_with_retries(
            "test",
            || operation.invoke(42),
            &RetryPolicy::new(),
            None,
            true,
            false,
        )
        .await;

    assert!(matches!(result, Err(MuninError::Closed)));
    assert_eq!(operation.call_count(), 0);
}

#[tokio::test]
async fn shutdown_inside_recovery_propagates_unchanged() {
    let resource = Arc::new(RetryableResource::new());
    {
        let resource = Arc::clone(&resource);
        tokio::spawn(async move { resource.circuit().close() })
            .await
            .unwrap();
    }

    let operation = FailThenSucceed::new(1, connection_shutdown);
    let mut stats = RetryStats::new(RetryPolicy::new());
    let start = Instant::now();
    let result = resource
        .call_with_retries(
            "test",
            || operation.invoke(42),
            &RetryPolicy::new(),
            Some(&mut stats),
            true,
            false,
        )
        .await;

    // No park on the closed circuit: the supervisor must see it at once.
    assert!(matches!(result, Err(MuninError::Shutdown(_))));
    assert_eq!(operation.call_count(), 1);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn unrecoverable_resource_propagates_shutdown() {
    let resource = RetryableResource::new();
    let operation = FailThenSucceed::new(1, connection_shutdown);

    let result = resource
        .call_with_retries(
            "test",
            || operation.invoke(42),
            &RetryPolicy::new().max_attempts(5),
            None,
            false,
            false,
        )
        .await;

    assert!(matches!(result, Err(MuninError::Shutdown(_))));
    assert_eq!(operation.call_count(), 1);
}

#[tokio::test]
async fn bounded_wait_on_circuit_times_out_to_original_error() {
    let resource = Arc::new(RetryableResource::new());
    {
        let resource = Arc::clone(&resource);
        tokio::spawn(async move { resource.circuit().close() })
            .await
            .unwrap();
    }

    let operation = FailThenSucceed::new(u32::MAX, connection_shutdown);
    let policy = RetryPolicy::new().max_duration(Duration::from_millis(30));

    let start = Instant::now();
    let result = resource
        .call_with_retries("test", || operation.invoke(42), &policy, None, true, false)
        .await;

    assert!(matches!(result, Err(MuninError::Shutdown(_))));
    assert_eq!(operation.call_count(), 1);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn circuit_owner_passes_through_without_blocking() {
    let resource = Arc::new(RetryableResource::new());
    let resource_clone = Arc::clone(&resource);

    // The same task closes the circuit and then waits: reentrant passthrough.
    let outcome = tokio::spawn(async move {
        resource_clone.circuit().close();
        resource_clone
            .circuit()
            .wait_open(Some(Duration::from_millis(10)))
            .await
    })
    .await
    .unwrap();

    assert_eq!(outcome, GateWait::Opened);
}
