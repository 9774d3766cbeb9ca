//! Per-CPU compare sources
//!
//! A comparator raises its CPU's timer interrupt once the clock reaches the
//! armed value. Arming replaces the previous value. When it fires the
//! comparator runs its handler in the CPU's interrupt context; the handler
//! returns the next deadline to arm, if any.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use vrt_base::{cpu, Clock, CpuId, TimeValue};

use crate::{Result, TimerError};

/// Interrupt handler of a comparator, returning the next deadline
pub type FireHandler = Box<dyn Fn() -> Option<TimeValue> + Send + Sync>;

/// One programmable compare source
pub trait Comparator: Send + Sync {
    /// Fire at `deadline` (ticks of the timer clock), replacing any earlier arming
    fn arm(&self, deadline: TimeValue);

    /// Cancel the current arming
    fn disarm(&self);
}

#[derive(Debug, Default)]
struct State {
    deadline: Option<TimeValue>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Comparator emulated by a host thread bound to its CPU
pub struct SoftComparator {
    cpu: CpuId,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SoftComparator {
    /// Start the comparator thread of `cpu`
    pub fn spawn(cpu: CpuId, clock: Clock, handler: FireHandler) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread = thread::Builder::new()
            .name(format!("timer-cpu{}", cpu))
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(cpu, clock, &shared, handler)
            })
            .map_err(|source| TimerError::Comparator { cpu, source })?;
        Ok(Self {
            cpu,
            shared,
            thread: Some(thread),
        })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Currently armed deadline
    pub fn armed(&self) -> Option<TimeValue> {
        self.shared.lock().deadline
    }
}

fn run(cpu: CpuId, clock: Clock, shared: &Shared, handler: FireHandler) {
    cpu::bind(cpu);
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(deadline) = state.deadline else {
            state = shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        let left = clock.until(deadline);
        if !left.is_zero() {
            state = shared
                .cond
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        state.deadline = None;
        drop(state);
        let next = handler();
        state = shared.lock();
        // An arming that raced with the handler may be earlier than `next`
        state.deadline = match (state.deadline, next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    log::trace!("timer-cpu{}: comparator stopped", cpu);
}

impl Comparator for SoftComparator {
    fn arm(&self, deadline: TimeValue) {
        self.shared.lock().deadline = Some(deadline);
        self.shared.cond.notify_one();
    }

    fn disarm(&self) {
        self.shared.lock().deadline = None;
        self.shared.cond.notify_one();
    }
}

impl Drop for SoftComparator {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cond.notify_one();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("timer-cpu{}: comparator thread panicked", self.cpu);
            }
        }
    }
}
