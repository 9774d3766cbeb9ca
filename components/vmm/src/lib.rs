//! Device Model - Message buses and the virtual motherboard
//!
//! # Purpose
//! Lets independent device modules of a virtual machine talk to each other
//! without holding references to one another. Every kind of request or
//! event has its own message type and its own bus; a device subscribes to
//! the buses it serves and publishes on the buses it needs.
//!
//! # Integration Points
//! - Depends on: `vrt-storage` (backend controllers), `vrt-hw` (DMA
//!   buffers), `vrt-base` (clock)
//! - Provides to: device emulation, the `vrt-vmm` launcher
//! - IPC endpoints: None
//! - Capabilities required: None (backends bring their own)
//!
//! # Architecture
//! - [`Bus`]: ordered subscriber list, first claim wins
//! - [`Motherboard`]: one bus per message type plus the shared clock
//! - [`DeviceRegistry`]: named creation functions driven by the boot
//!   command line
//! - [`HostDisk`]: bridges disk messages onto a storage [`Controller`]
//!
//! Buses are single-threaded. Anything that completes on another thread
//! (storage interrupts) is queued and drained on the thread owning the
//! motherboard.
//!
//! # Testing Strategy
//! - Unit tests: bus dispatch, command-line tokenizing
//! - Integration tests: device creation from a command line, host disk
//!   round trips through a memory backend
//!
//! [`Controller`]: vrt_storage::Controller

pub mod bus;
pub mod hostdisk;
pub mod message;
mod motherboard;
mod params;

use thiserror::Error;

pub use bus::{Bus, Receiver};
pub use hostdisk::{HostDisk, HostDisks};
pub use motherboard::{Motherboard, DEFAULT_CLOCK_FREQUENCY};
pub use params::{Creator, DeviceRegistry, ParseReport, ARG_COUNT, ARG_MISSING};

/// Error types for device creation
#[derive(Debug, Error)]
pub enum VmmError {
    #[error("Device {name} registered twice")]
    DuplicateDevice { name: String },

    #[error("{device}: argument {index} is required")]
    MissingArgument { device: &'static str, index: usize },

    #[error("{device}: disk {disk} already attached")]
    DiskInUse { device: &'static str, disk: u64 },

    #[error("Storage backend error: {0}")]
    Storage(#[from] vrt_storage::StorageError),
}

pub type Result<T> = core::result::Result<T, VmmError>;
