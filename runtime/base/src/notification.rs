//! Notification - Blocking/wake primitive
//!
//! A notification is the wake handle a client blocks on while a service
//! finishes work on its behalf (a timer deadline, an I/O completion). It is
//! a counting semaphore: every `signal` is consumed by exactly one `wait`,
//! so a signal that arrives before the client blocks is not lost.
//!
//! ## Operations
//!
//! - **Signal**: increment the pending count and wake one waiter
//! - **Wait**: block until the count is non-zero, then consume one signal
//! - **Poll**: consume one signal if present, never block
//! - **Peek**: inspect the pending count without consuming

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Counting wake primitive shared between a client and a service
#[derive(Default)]
pub struct Notification {
    pending: Mutex<u64>,
    wakeup: Condvar,
}

impl Notification {
    /// Create a notification with no signals pending
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            wakeup: Condvar::new(),
        }
    }

    /// Deliver one signal
    pub fn signal(&self) {
        let mut pending = self.count();
        *pending += 1;
        self.wakeup.notify_one();
    }

    /// Block until a signal is pending and consume it
    pub fn wait(&self) {
        let mut pending = self.count();
        while *pending == 0 {
            pending = self
                .wakeup
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *pending -= 1;
    }

    /// Block for at most `timeout`
    ///
    /// Returns `true` if a signal was consumed, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.count();
        while *pending == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wakeup
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
        *pending -= 1;
        true
    }

    /// Consume one signal if one is pending
    pub fn poll(&self) -> bool {
        let mut pending = self.count();
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }

    /// Number of signals not yet consumed
    pub fn peek(&self) -> u64 {
        *self.count()
    }

    fn count(&self) -> MutexGuard<'_, u64> {
        // The counter stays consistent even if a holder panicked
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for Notification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notification")
            .field("pending", &self.peek())
            .finish()
    }
}
