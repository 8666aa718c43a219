//! Admission gate and in-flight tracking for safe routing changes.
//!
//! Every query and exec holds an [`AdmissionPermit`] for its whole duration.
//! A routing change that must not race with traffic does:
//!
//! ```text
//! close ──► drain (in_flight == 0) ──► mutate routing ──► open
//! ```
//!
//! The gate flag and the counter live under one mutex, so admission (check
//! open + increment) cannot interleave with `close`: once `close` returns, no
//! new permit is issued until `open`, and `drain` observing zero means no
//! request is still running against the old route.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug)]
struct GateState {
    open: bool,
    in_flight: usize,
    closed_at: Option<Instant>,
}

/// Process-wide admission gate.
#[derive(Debug)]
pub struct QuiesceGate {
    state: Mutex<GateState>,
    /// Signalled when the gate opens.
    reopened: Notify,
    /// Signalled when the in-flight count drops to zero.
    drained: Notify,
}

impl Default for QuiesceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl QuiesceGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                in_flight: 0,
                closed_at: None,
            }),
            reopened: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Admit one operation, waiting while the gate is closed.
    pub async fn admit(&self) -> AdmissionPermit<'_> {
        loop {
            // Register for the wakeup before checking, so an `open` between the
            // check and the await is not missed.
            let notified = self.reopened.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_admit() {
                return permit;
            }

            notified.await;
        }
    }

    /// Admit one operation if the gate is open right now.
    pub fn try_admit(&self) -> Option<AdmissionPermit<'_>> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        state.in_flight += 1;
        Some(AdmissionPermit { gate: self })
    }

    fn release(&self) {
        let drained = {
            let mut state = self.state.lock();
            debug_assert!(state.in_flight > 0, "release without admission");
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight == 0
        };

        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Stop admitting. Already admitted operations are unaffected.
    ///
    /// Returns `false` if the gate was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        state.closed_at = Some(Instant::now());
        debug!(in_flight = state.in_flight, "Quiesce gate closed");
        true
    }

    /// Resume admitting and wake every waiting admitter.
    pub fn open(&self) {
        let closed_for = {
            let mut state = self.state.lock();
            state.open = true;
            state.closed_at.take().map(|t| t.elapsed())
        };

        self.reopened.notify_waiters();

        if let Some(closed_for) = closed_for {
            info!(closed_ms = closed_for.as_millis() as u64, "Quiesce gate reopened");
        }
    }

    /// Close the gate and get a guard that reopens it when dropped.
    ///
    /// The reopen runs on every exit path of the holder, including errors and
    /// unwinding. If the gate was already closed, the guard leaves it to
    /// whoever closed it.
    pub fn quiesce(&self) -> ClosedGate<'_> {
        let reopen = self.close();
        ClosedGate { gate: self, reopen }
    }

    /// Wait until no admitted operation is running.
    ///
    /// Call only while the gate is closed; otherwise new admissions can keep
    /// the count above zero. With a timeout, returns [`Error::Timeout`] if
    /// the count has not reached zero in time.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.in_flight() == 0 {
                    return;
                }

                notified.await;
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| Error::Timeout),
            None => {
                wait.await;
                Ok(())
            }
        }
    }
}

/// Proof of admission. Dropping it releases the in-flight slot.
#[derive(Debug)]
#[must_use = "dropping the permit releases the admission immediately"]
pub struct AdmissionPermit<'a> {
    gate: &'a QuiesceGate,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Holds the gate closed; reopens it on drop.
#[derive(Debug)]
#[must_use = "dropping the guard reopens the gate immediately"]
pub struct ClosedGate<'a> {
    gate: &'a QuiesceGate,
    /// Whether this guard closed the gate.
    reopen: bool,
}

impl ClosedGate<'_> {
    pub fn gate(&self) -> &QuiesceGate {
        self.gate
    }
}

impl Drop for ClosedGate<'_> {
    fn drop(&mut self) {
        if self.reopen {
            self.gate.open();
        }
    }
}
