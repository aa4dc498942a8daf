use std::sync::Arc;
use std::time::{Duration, Instant};

use munin::{Circuit, GateWait};

/// Close the circuit from a throwaway task so the test task is not the
/// owner and genuinely blocks on `wait_open`.
async fn close_from_other_task(circuit: &Arc<Circuit>) {
    let circuit = Arc::clone(circuit);
    tokio::spawn(async move { circuit.close() }).await.unwrap();
}

#[tokio::test]
async fn open_circuit_passes_through() {
    let circuit = Circuit::new();
    assert!(!circuit.is_closed());
    assert_eq!(circuit.wait_open(None).await, GateWait::Opened);
}

#[tokio::test]
async fn waiter_parks_until_open() {
    let circuit = Arc::new(Circuit::new());
    close_from_other_task(&circuit).await;
    assert!(circuit.is_closed());

    let waiter = {
        let circuit = Arc::clone(&circuit);
        tokio::spawn(async move { circuit.wait_open(None).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    circuit.open();
    assert_eq!(waiter.await.unwrap(), GateWait::Opened);
    assert!(!circuit.is_closed());
}

#[tokio::test]
async fn multiple_waiters_all_released() {
    let circuit = Arc::new(Circuit::new());
    close_from_other_task(&circuit).await;

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let circuit = Arc::clone(&circuit);
            tokio::spawn(async move { circuit.wait_open(None).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    circuit.open();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), GateWait::Opened);
    }
}

#[tokio::test]
async fn bounded_wait_times_out() {
    let circuit = Arc::new(Circuit::new());
    close_from_other_task(&circuit).await;

    let start = Instant::now();
    let outcome = circuit.wait_open(Some(Duration::from_millis(30))).await;
    assert_eq!(outcome, GateWait::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(circuit.is_closed());
}

#[tokio::test]
async fn interrupt_wakes_waiters_distinctly() {
    let circuit = Arc::new(Circuit::new());
    close_from_other_task(&circuit).await;

    let waiter = {
        let circuit = Arc::clone(&circuit);
        tokio::spawn(async move { circuit.wait_open(None).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    circuit.interrupt_waiters();

    assert_eq!(waiter.await.unwrap(), GateWait::Interrupted);
    // Interrupt wakes waiters without opening the gate.
    assert!(circuit.is_closed());
}

#[tokio::test]
async fn interrupt_does_not_release_later_waiters() {
    let circuit = Arc::new(Circuit::new());
    close_from_other_task(&circuit).await;
    circuit.interrupt_waiters();

    // A waiter arriving after the interrupt still parks until open.
    let outcome = circuit.wait_open(Some(Duration::from_millis(30))).await;
    assert_eq!(outcome, GateWait::TimedOut);
}

#[tokio::test]
async fn owner_reenters_without_blocking() {
    let circuit = Arc::new(Circuit::new());
    let outcome = tokio::spawn(async move {
        circuit.close();
        circuit.wait_open(None).await
    })
    .await
    .unwrap();
    assert_eq!(outcome, GateWait::Opened);
}

#[tokio::test]
async fn nested_closes_require_matching_opens() {
    let circuit = Arc::new(Circuit::new());
    let circuit_clone = Arc::clone(&circuit);
    tokio::spawn(async move {
        circuit_clone.close();
        circuit_clone.close();
        circuit_clone.open();
        // Depth is back to one: still closed.
        assert!(circuit_clone.is_closed());
        circuit_clone.open();
    })
    .await
    .unwrap();
    assert!(!circuit.is_closed());
    assert_eq!(circuit.wait_open(None).await, GateWait::Opened);
}

#[tokio::test]
async fn close_by_non_owner_is_a_no_op() {
    let circuit = Arc::new(Circuit::new());
    close_from_other_task(&circuit).await;
    // Second close from a different task does not deepen the nesting.
    close_from_other_task(&circuit).await;

    circuit.open();
    assert!(!circuit.is_closed());
}

#[tokio::test]
async fn open_of_open_circuit_is_a_no_op() {
    let circuit = Circuit::new();
    circuit.open();
    circuit.open();
    assert!(!circuit.is_closed());
    assert_eq!(circuit.wait_open(None).await, GateWait::Opened);
}
