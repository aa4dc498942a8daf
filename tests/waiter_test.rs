use std::sync::Arc;
use std::time::{Duration, Instant};

use munin::Waiter;

#[tokio::test]
async fn sleeps_for_the_full_duration() {
    let waiter = Waiter::new();
    let start = Instant::now();
    waiter.wait_for(Duration::from_millis(30)).await;
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn interrupt_wakes_sleepers_early() {
    let waiter = Arc::new(Waiter::new());

    let sleeper = {
        let waiter = Arc::clone(&waiter);
        tokio::spawn(async move {
            let start = Instant::now();
            waiter.wait_for(Duration::from_secs(10)).await;
            start.elapsed()
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    waiter.interrupt_waiters();

    let slept = sleeper.await.unwrap();
    assert!(slept < Duration::from_secs(1));
}

#[tokio::test]
async fn interrupt_wakes_every_sleeper() {
    let waiter = Arc::new(Waiter::new());

    let sleepers: Vec<_> = (0..4)
        .map(|_| {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.wait_for(Duration::from_secs(10)).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(30)).await;
    waiter.interrupt_waiters();

    let start = Instant::now();
    for sleeper in sleepers {
        sleeper.await.unwrap();
    }
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn interrupt_before_sleep_does_not_consume_the_next_wait() {
    let waiter = Waiter::new();
    waiter.interrupt_waiters();

    // A later sleeper is unaffected by a past interrupt.
    let start = Instant::now();
    waiter.wait_for(Duration::from_millis(30)).await;
    assert!(start.elapsed() >= Duration::from_millis(30));
}
