//! The gate separating normal operation from recovery in flight.
//!
//! A [`Circuit`] is open while the transport is healthy and closed while a
//! replacement transport is being rebuilt. Callers whose operation failed
//! with a transport shutdown park on the circuit until the supervisor has
//! reopened it; the supervisor itself passes straight through (reentrant
//! owner discipline), so recovery work is never gated by its own circuit.
//!
//! Waiters are released by one of three outcomes: the gate opened, the wait
//! timed out, or the resource was closed and interrupted every waiter. The
//! signal is carried on a `tokio::sync::watch` channel, so a waiter that
//! arrives after the open observes the gate as open without blocking.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task;

/// Outcome of a [`Circuit::wait_open`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    /// The gate opened (or was already open, or the waiter owns the gate).
    Opened,
    /// The time bound elapsed before the gate opened.
    TimedOut,
    /// The waiter was woken by an explicit interrupt.
    Interrupted,
}

#[derive(Debug)]
struct Gate {
    depth: u32,
    owner: Option<task::Id>,
}

#[derive(Debug, Clone, Copy)]
struct Signal {
    open: bool,
    interrupts: u64,
}

/// Latch-style gate with a reentrant-owner discipline.
#[derive(Debug)]
pub struct Circuit {
    gate: Mutex<Gate>,
    tx: watch::Sender<Signal>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// Create an open circuit.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Signal {
            open: true,
            interrupts: 0,
        });
        Self {
            gate: Mutex::new(Gate {
                depth: 0,
                owner: None,
            }),
            tx,
        }
    }

    /// Whether the gate is currently closed.
    pub fn is_closed(&self) -> bool {
        self.gate.lock().depth > 0
    }

    /// Close the gate, recording the current task as owner.
    ///
    /// A nested close by the owner increments the depth and must be matched
    /// by an open before the gate truly opens. A close by any other caller
    /// while the gate is already closed is a no-op.
    pub fn close(&self) {
        let mut gate = self.gate.lock();
        if gate.depth > 0 {
            if gate.owner.is_some() && gate.owner == task::try_id() {
                gate.depth += 1;
            }
            return;
        }
        gate.depth = 1;
        gate.owner = task::try_id();
        self.tx.send_modify(|signal| signal.open = false);
    }

    /// Open the gate. When the nesting depth returns to zero the owner is
    /// cleared and every waiter is released. Opening an open gate is a
    /// no-op.
    pub fn open(&self) {
        let mut gate = self.gate.lock();
        if gate.depth == 0 {
            return;
        }
        gate.depth -= 1;
        if gate.depth == 0 {
            gate.owner = None;
            self.tx.send_modify(|signal| signal.open = true);
        }
    }

    /// Wake every waiter with [`GateWait::Interrupted`]. The gate itself
    /// stays closed; waiters that arrive later still block.
    pub fn interrupt_waiters(&self) {
        self.tx.send_modify(|signal| signal.interrupts += 1);
    }

    /// Block until the gate opens, the optional time bound elapses, or an
    /// interrupt fires. Returns immediately with [`GateWait::Opened`] if the
    /// gate is open or the calling task is the owner that closed it.
    pub async fn wait_open(&self, timeout: Option<Duration>) -> GateWait {
        {
            let gate = self.gate.lock();
            if gate.depth == 0 || (gate.owner.is_some() && gate.owner == task::try_id()) {
                return GateWait::Opened;
            }
        }

        let mut rx = self.tx.subscribe();
        let baseline = {
            let signal = *rx.borrow_and_update();
            if signal.open {
                return GateWait::Opened;
            }
            signal.interrupts
        };

        let wait = async move {
            loop {
                if rx.changed().await.is_err() {
                    // Sender gone means the resource is being torn down.
                    return GateWait::Interrupted;
                }
                let signal = *rx.borrow_and_update();
                if signal.interrupts > baseline {
                    return GateWait::Interrupted;
                }
                if signal.open {
                    return GateWait::Opened;
                }
            }
        };

        match timeout {
            Some(bound) => tokio::time::timeout(bound, wait)
                .await
                .unwrap_or(GateWait::TimedOut),
            None => wait.await,
        }
    }
}
