//! Base primitives - Synchronization, CPU identity and time
//!
//! # Purpose
//! Leaf crate shared by every service and driver of the runtime. It provides
//! the few primitives that must work before (or beneath) any blocking
//! scheduler abstraction: a spin lock, a counting wake primitive, the notion
//! of "the CPU this thread runs on" and a monotonic clock.
//!
//! # Integration Points
//! - Depends on: host threads only
//! - Provides to: hardware resources, IPC sessions, storage and timer services
//! - IPC endpoints: None
//! - Capabilities required: None
//!
//! # Architecture
//! - [`SpinLock`]: CAS acquire, release-store unlock, RAII guard
//! - [`Notification`]: counting semaphore used as the per-CPU wake handle
//! - [`cpu`]: thread-to-CPU binding and the CPU set of the machine
//! - [`Clock`]: tick source with frequency conversion
//!
//! # Testing Strategy
//! - Unit tests: lock exclusion, signal/wait accounting, clock conversion
//! - Integration tests: exercised by the timer and storage crates

pub mod clock;
pub mod cpu;
mod notification;
mod spinlock;

pub use clock::{Clock, TimeValue};
pub use cpu::{CpuId, CpuSet};
pub use notification::Notification;
pub use spinlock::{SpinLock, SpinLockGuard};
