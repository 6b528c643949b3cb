use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Cooperative stop signal shared by a job's work loop, its duration timer,
/// and manual stop requests. Every termination trigger funnels through this
/// one token, so racing triggers cannot produce inconsistent state.
#[derive(Debug, Default)]
pub struct StopToken {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns true for the caller that flipped the token;
    /// later callers see false and do nothing.
    pub fn stop(&self) -> bool {
        let first = self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&self) {
        loop {
            // Register interest before re-checking, so a stop() landing in
            // between cannot be missed.
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-loop run bound: an optional unit count and an optional deadline.
/// Deadlines gate admission of the next unit; the count bound trips after a
/// unit completes, so the final admitted unit is always accounted before the
/// loop stops.
#[derive(Debug)]
pub struct RunGate {
    completed: AtomicU64,
    limit: Option<u64>,
    deadline: Option<Instant>,
}

impl RunGate {
    pub fn new(limit: Option<u64>, duration: Option<Duration>) -> Self {
        Self {
            completed: AtomicU64::new(0),
            limit,
            deadline: duration.map(|d| Instant::now() + d),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Admit the next unit of work. False once the deadline has passed.
    pub fn next(&self) -> bool {
        !self.expired()
    }

    /// Record one completed unit. True when the count bound has now been
    /// reached and the loop should stop.
    pub fn complete_one(&self) -> bool {
        match self.limit {
            Some(limit) => self.completed.fetch_add(1, Ordering::Relaxed) + 1 >= limit,
            None => false,
        }
    }
}
