//! Per-CPU client state
//!
//! A session keeps one slot per CPU. The slot array is allocated once when
//! the session is created; each slot is filled lazily, the first time the
//! client is served on that CPU, and only by that CPU. Partitioning instead
//! of locking is what keeps the hot request path free of cross-CPU
//! contention, so the owner check is enforced on every access.

use std::sync::OnceLock;

use vrt_base::{cpu, CpuId, CpuSet};

use crate::{IpcError, Result};

/// One lazily created value per CPU
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: Box<[OnceLock<T>]>,
}

impl<T> PerCpu<T> {
    /// Allocate the (empty) slot array for `cpus`
    pub fn new(cpus: CpuSet) -> Self {
        Self {
            slots: cpus.iter().map(|_| OnceLock::new()).collect(),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Get the value of `cpu`, creating it with `init` on first use
    ///
    /// Repeated calls for the same CPU return the same value.
    ///
    /// # Errors
    /// Returns `CrossCpu` if the calling thread is not bound to `cpu`, and
    /// `NoSuchCpu` if `cpu` has no slot.
    pub fn get_or_init(&self, cpu: CpuId, init: impl FnOnce() -> T) -> Result<&T> {
        let slot = self.slots.get(cpu).ok_or(IpcError::NoSuchCpu { cpu })?;
        let current = cpu::current();
        if current != Some(cpu) {
            return Err(IpcError::CrossCpu {
                owner: cpu,
                current,
            });
        }
        Ok(slot.get_or_init(init))
    }

    /// Look at the value of `cpu` without creating it
    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu).and_then(OnceLock::get)
    }

    /// Iterate the values created so far with their CPU
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(cpu, slot)| slot.get().map(|value| (cpu, value)))
    }
}
