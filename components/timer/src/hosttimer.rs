//! Host timer - deadline lists multiplexed onto per-CPU comparators
//!
//! Each CPU keeps a short list of (client, deadline) entries, at most one
//! per client. Programming a deadline replaces the client's entry and arms
//! the CPU's comparator with the earliest deadline in the list. When the
//! comparator fires, every expired entry is removed and its wake handle
//! signalled once.
//!
//! The list is shared between the owning CPU's request path and its timer
//! interrupt, so it sits behind a spin lock; no other CPU ever takes it
//! except when a session is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vrt_base::{cpu, Clock, CpuId, CpuSet, SpinLock, TimeValue};
use vrt_ipc::Handle;

use crate::comparator::{Comparator, FireHandler, SoftComparator};
use crate::{Result, TimerConfig, TimerError};

#[derive(Debug)]
struct Entry {
    client: u64,
    deadline: TimeValue,
    wake: Handle,
}

/// Deadline list of one CPU
#[derive(Debug)]
struct CpuQueue {
    cpu: CpuId,
    clock: Clock,
    entries: SpinLock<Vec<Entry>>,
}

impl CpuQueue {
    /// Install `deadline` for `client`, returning the earliest deadline
    fn program(&self, client: u64, deadline: TimeValue, wake: &Handle) -> TimeValue {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.client == client) {
            Some(entry) => entry.deadline = deadline,
            None => entries.push(Entry {
                client,
                deadline,
                wake: Arc::clone(wake),
            }),
        }
        entries.iter().map(|e| e.deadline).min().unwrap_or(deadline)
    }

    fn cancel(&self, client: u64) {
        self.entries.lock().retain(|e| e.client != client);
    }

    /// Signal expired entries and return the next deadline
    fn expire(&self) -> Option<TimeValue> {
        let now = self.clock.time();
        let (fired, next) = {
            let mut entries = self.entries.lock();
            let mut fired = Vec::new();
            entries.retain(|e| {
                if e.deadline <= now {
                    fired.push(Arc::clone(&e.wake));
                    false
                } else {
                    true
                }
            });
            (fired, entries.iter().map(|e| e.deadline).min())
        };
        if !fired.is_empty() {
            log::trace!("timer-cpu{}: {} deadline(s) expired", self.cpu, fired.len());
        }
        for wake in fired {
            wake.signal();
        }
        next
    }

    fn pending(&self) -> usize {
        self.entries.lock().len()
    }
}

struct CpuTimer {
    queue: Arc<CpuQueue>,
    comparator: Box<dyn Comparator>,
}

/// Timer backend with one comparator per CPU
pub struct HostTimer {
    clock: Clock,
    cpus: CpuSet,
    timers: Vec<CpuTimer>,
    next_client: AtomicU64,
}

impl HostTimer {
    /// Create a timer with a [`SoftComparator`] per configured CPU
    pub fn new(config: &TimerConfig) -> Result<Self> {
        Self::with_comparators(config, |cpu, clock, handler| {
            let comparator = SoftComparator::spawn(cpu, clock, handler)?;
            Ok(Box::new(comparator) as Box<dyn Comparator>)
        })
    }

    /// Create a timer using comparators built by `make`
    ///
    /// `make` receives the CPU, the timer clock and the handler the
    /// comparator must run when it fires.
    pub fn with_comparators<F>(config: &TimerConfig, mut make: F) -> Result<Self>
    where
        F: FnMut(CpuId, Clock, FireHandler) -> Result<Box<dyn Comparator>>,
    {
        let clock = Clock::new(config.frequency);
        let timers = config
            .cpus
            .iter()
            .map(|cpu| {
                let queue = Arc::new(CpuQueue {
                    cpu,
                    clock,
                    entries: SpinLock::new(Vec::new()),
                });
                let handler: FireHandler = {
                    let queue = Arc::clone(&queue);
                    Box::new(move || queue.expire())
                };
                Ok(CpuTimer {
                    queue,
                    comparator: make(cpu, clock, handler)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "Host timer: {} CPU(s), {} Hz",
            timers.len(),
            config.frequency
        );
        Ok(Self {
            clock,
            cpus: config.cpus,
            timers,
            next_client: AtomicU64::new(0),
        })
    }

    /// Clock deadlines and times are measured in
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn cpus(&self) -> CpuSet {
        self.cpus
    }

    fn timer(&self, cpu: CpuId) -> Result<&CpuTimer> {
        self.timers.get(cpu).ok_or(TimerError::NoSuchCpu { cpu })
    }

    /// Create the backend state of a client on `cpu`
    pub fn client(&self, cpu: CpuId, wake: Handle) -> Result<ClientData> {
        let timer = self.timer(cpu)?;
        Ok(ClientData {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            cpu,
            wake,
            queue: Arc::clone(&timer.queue),
        })
    }

    /// Program `deadline` for `client` on its CPU
    ///
    /// Replaces a deadline programmed earlier and not yet expired. Must be
    /// called on the client's CPU.
    pub fn program(&self, client: &ClientData, deadline: TimeValue) -> Result<()> {
        let current = cpu::current();
        if current != Some(client.cpu) {
            return Err(TimerError::CrossCpu {
                owner: client.cpu,
                current,
            });
        }
        let timer = self.timer(client.cpu)?;
        let earliest = timer.queue.program(client.id, deadline, &client.wake);
        timer.comparator.arm(earliest);
        log::trace!(
            "timer-cpu{}: client {} deadline {} (armed {})",
            client.cpu,
            client.id,
            deadline,
            earliest
        );
        Ok(())
    }

    /// Run the expiry of `cpu` as its timer interrupt would
    pub fn expire(&self, cpu: CpuId) -> Result<()> {
        let timer = self.timer(cpu)?;
        match timer.queue.expire() {
            Some(next) => timer.comparator.arm(next),
            None => timer.comparator.disarm(),
        }
        Ok(())
    }

    /// Deadlines waiting on `cpu`
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.timers.get(cpu).map_or(0, |t| t.queue.pending())
    }
}

/// Timer state of one client on one CPU
///
/// Dropping it cancels the client's pending deadline on that CPU.
#[derive(Debug)]
pub struct ClientData {
    id: u64,
    cpu: CpuId,
    wake: Handle,
    queue: Arc<CpuQueue>,
}

impl ClientData {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Handle signalled when this client's deadline expires
    pub fn wake(&self) -> &Handle {
        &self.wake
    }
}

impl Drop for ClientData {
    fn drop(&mut self) {
        self.queue.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vrt_base::Notification;

    /// Comparator that only records what it was told
    #[derive(Default)]
    struct Recorder {
        armed: Arc<Mutex<Option<TimeValue>>>,
    }

    impl Comparator for Recorder {
        fn arm(&self, deadline: TimeValue) {
            *self.armed.lock().unwrap() = Some(deadline);
        }

        fn disarm(&self) {
            *self.armed.lock().unwrap() = None;
        }
    }

    fn recording_timer(cpus: usize) -> (HostTimer, Vec<Arc<Mutex<Option<TimeValue>>>>) {
        let mut armed = Vec::new();
        let config = TimerConfig {
            cpus: CpuSet::new(cpus),
            frequency: 1_000,
        };
        let timer = HostTimer::with_comparators(&config, |_, _, _| {
            let recorder = Recorder::default();
            armed.push(Arc::clone(&recorder.armed));
            Ok(Box::new(recorder) as Box<dyn Comparator>)
        })
        .unwrap();
        (timer, armed)
    }

    fn wake() -> Handle {
        Arc::new(Notification::new())
    }

    #[test]
    fn test_earliest_deadline_is_armed() {
        let (timer, armed) = recording_timer(1);
        let a = timer.client(0, wake()).unwrap();
        let b = timer.client(0, wake()).unwrap();
        cpu::bind(0);

        timer.program(&a, 50_000).unwrap();
        assert_eq!(*armed[0].lock().unwrap(), Some(50_000));
        timer.program(&b, 20_000).unwrap();
        assert_eq!(*armed[0].lock().unwrap(), Some(20_000));
        assert_eq!(timer.pending(0), 2);

        cpu::unbind();
    }

    #[test]
    fn test_last_write_wins() {
        let (timer, armed) = recording_timer(1);
        let client = timer.client(0, wake()).unwrap();
        cpu::bind(0);

        timer.program(&client, 10_000).unwrap();
        timer.program(&client, 90_000).unwrap();
        assert_eq!(timer.pending(0), 1);
        assert_eq!(*armed[0].lock().unwrap(), Some(90_000));

        // The earlier deadline is gone: expiring now signals nothing
        timer.expire(0).unwrap();
        assert_eq!(client.wake().peek(), 0);
        assert_eq!(*armed[0].lock().unwrap(), Some(90_000));

        cpu::unbind();
    }

    #[test]
    fn test_expired_deadline_signals_once() {
        let (timer, armed) = recording_timer(2);
        let early = timer.client(1, wake()).unwrap();
        let late = timer.client(1, wake()).unwrap();
        cpu::bind(1);

        timer.program(&early, 0).unwrap();
        timer.program(&late, u64::MAX).unwrap();
        timer.expire(1).unwrap();
        timer.expire(1).unwrap();

        assert_eq!(early.wake().peek(), 1);
        assert_eq!(late.wake().peek(), 0);
        assert_eq!(timer.pending(1), 1);
        assert_eq!(*armed[1].lock().unwrap(), Some(u64::MAX));
        assert_eq!(*armed[0].lock().unwrap(), None);

        drop(late);
        timer.expire(1).unwrap();
        assert_eq!(*armed[1].lock().unwrap(), None);

        cpu::unbind();
    }

    #[test]
    fn test_cross_cpu_program_rejected() {
        let (timer, armed) = recording_timer(2);
        let client = timer.client(1, wake()).unwrap();
        cpu::bind(0);

        let err = timer.program(&client, 5).unwrap_err();
        assert!(matches!(
            err,
            TimerError::CrossCpu {
                owner: 1,
                current: Some(0)
            }
        ));
        assert_eq!(timer.pending(1), 0);
        assert_eq!(*armed[1].lock().unwrap(), None);

        cpu::unbind();
    }

    #[test]
    fn test_unknown_cpu() {
        let (timer, _) = recording_timer(1);
        assert!(matches!(
            timer.client(3, wake()),
            Err(TimerError::NoSuchCpu { cpu: 3 })
        ));
    }
}
