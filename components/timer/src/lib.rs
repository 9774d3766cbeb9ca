//! Timer Service - Per-CPU deadline wakeups and time of day
//!
//! # Purpose
//! Lets clients sleep until an absolute point in time. Every client gets one
//! wake handle per CPU; a deadline programmed on a CPU signals that CPU's
//! handle exactly once when it expires. Also reports monotonic uptime and
//! wall-clock time.
//!
//! # Integration Points
//! - Depends on: `vrt-base` (clock, notifications, CPU identity, spin lock),
//!   `vrt-ipc` (sessions, per-CPU state, request frames)
//! - Provides to: any client needing timeouts (device model, drivers)
//! - IPC endpoints: the timer portal (`GET_WAKE_HANDLES`, `PROGRAM_TIMER`,
//!   `GET_TIME`)
//! - Capabilities required: one comparator per CPU
//!
//! # Architecture
//! - [`Comparator`]: per-CPU compare source; [`SoftComparator`] emulates one
//!   with a host thread bound to its CPU
//! - [`HostTimer`]: per-CPU deadline lists multiplexed onto the comparators
//! - [`TimerPortal`]: request dispatch with lazily created per-CPU client
//!   state
//!
//! # Testing Strategy
//! - Unit tests: deadline list bookkeeping, last-write-wins, cancellation
//! - Integration tests: deadline wakeup through the service, cross-CPU
//!   rejection, time reporting

mod comparator;
mod hosttimer;
mod service;

use thiserror::Error;
use vrt_base::{CpuId, CpuSet};
use vrt_ipc::{IpcError, Status};

pub use comparator::{Comparator, FireHandler, SoftComparator};
pub use hosttimer::{ClientData, HostTimer};
pub use service::{opcode, TimerPortal, TimerSession};

/// Default frequency of time values exchanged with clients (microseconds)
pub const DEFAULT_FREQUENCY: u64 = 1_000_000;

/// Timer service configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// CPUs with a comparator
    pub cpus: CpuSet,
    /// Ticks per second of deadlines and reported times
    pub frequency: u64,
}

impl TimerConfig {
    pub fn new(cpus: CpuSet) -> Self {
        Self {
            cpus,
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

/// Error types for timer operations
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("Deadline of CPU{owner} programmed from {current:?}")]
    CrossCpu { owner: CpuId, current: Option<CpuId> },

    #[error("CPU{cpu} has no timer")]
    NoSuchCpu { cpu: CpuId },

    #[error("Failed to start comparator of CPU{cpu}: {source}")]
    Comparator {
        cpu: CpuId,
        #[source]
        source: std::io::Error,
    },

    #[error("Real-time clock unavailable: {0}")]
    Rtc(String),
}

impl From<TimerError> for IpcError {
    fn from(err: TimerError) -> Self {
        match err {
            TimerError::CrossCpu { owner, current } => IpcError::CrossCpu { owner, current },
            TimerError::NoSuchCpu { cpu } => IpcError::NoSuchCpu { cpu },
            other => IpcError::Service {
                status: Status::ResourceUnavailable,
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = core::result::Result<T, TimerError>;
