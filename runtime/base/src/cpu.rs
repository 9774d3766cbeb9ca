//! CPU identity
//!
//! Services in this runtime run one worker thread per CPU. A worker binds
//! itself to its logical CPU once at start-up with [`bind`]; from then on
//! [`current`] reports that CPU. Code that partitions state per CPU uses
//! this to check that it only touches the partition of the CPU it runs on.
//!
//! Enumerating the physical CPUs is the job of the host microkernel; the
//! runtime only sees a [`CpuSet`] of logical ids `0..count`.

use std::cell::Cell;

/// Logical CPU id
pub type CpuId = usize;

thread_local! {
    static CURRENT: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Bind the calling thread to logical CPU `cpu`
///
/// Rebinding a thread replaces the previous binding.
pub fn bind(cpu: CpuId) {
    CURRENT.with(|c| c.set(Some(cpu)));
    log::trace!("thread {:?} bound to CPU{}", std::thread::current().name(), cpu);
}

/// Remove the binding of the calling thread
pub fn unbind() {
    CURRENT.with(|c| c.set(None));
}

/// The logical CPU the calling thread is bound to
pub fn current() -> Option<CpuId> {
    CURRENT.with(|c| c.get())
}

/// Set of logical CPUs available to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    count: usize,
}

impl CpuSet {
    /// CPU set with logical ids `0..count`
    ///
    /// # Panics
    /// Panics if `count` is zero
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "a machine has at least one CPU");
        Self { count }
    }

    /// CPU set sized to the host's available parallelism
    pub fn host() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(count)
    }

    /// Number of CPUs
    pub fn count(&self) -> usize {
        self.count
    }

    /// Check whether `cpu` belongs to this set
    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu < self.count
    }

    /// Iterate the logical CPU ids
    pub fn iter(&self) -> impl Iterator<Item = CpuId> {
        0..self.count
    }
}
