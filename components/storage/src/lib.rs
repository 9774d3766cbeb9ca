//! Storage Backends - Uniform asynchronous block I/O over host hardware
//!
//! # Purpose
//! Exposes heterogeneous storage hardware as one capability: enumerate
//! drives, report their geometry, and submit flush/read/write commands whose
//! outcome is delivered later to a caller-supplied completion sink together
//! with the caller's tag.
//!
//! # Integration Points
//! - Depends on: `vrt-hw` (registers, interrupt line, DMA), `vrt-base`
//! - Provides to: disk emulation in the device model, storage services
//! - IPC endpoints: None (completions go through [`Producer`]s)
//! - Capabilities required: AHCI BAR mapping, controller GSI, DMA memory
//!
//! # Architecture
//! - [`Controller`]: the backend capability trait
//! - [`AhciController`]: AHCI host bus adapter driver with an interrupt
//!   thread and per-port command slot tracking
//! - [`MemoryDisk`]: host-memory backend completing synchronously
//! - [`CompletionQueue`]: channel-backed completion sink
//!
//! # Testing Strategy
//! - Unit tests: request validation, FIS encoding, IDENTIFY parsing
//! - Integration tests: AHCI driver against a simulated HBA (probe,
//!   completion, backpressure, error and teardown paths)

pub mod ahci;
mod controller;
mod memdisk;

use thiserror::Error;

pub use ahci::{AhciConfig, AhciController};
pub use controller::{
    Completion, CompletionQueue, CompletionStatus, Controller, DriveFlags, DriveParams, Producer,
    Sector, Tag, Transfer,
};
pub use memdisk::MemoryDisk;

/// Error types for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Drive {drive} does not exist")]
    NoSuchDrive { drive: usize },

    #[error("Command queue of drive {drive} is full")]
    QueueFull { drive: usize },

    #[error("Sectors {sector}..+{count} outside drive of {capacity} sectors")]
    OutOfRange { sector: Sector, count: Sector, capacity: Sector },

    #[error("Buffer too small: need {needed} bytes at offset, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Request of {count} sectors exceeds the limit of {max}")]
    TooLarge { count: Sector, max: Sector },

    #[error("Zero-length transfer")]
    EmptyTransfer,

    #[error("Unusable drive geometry: {sectors} sectors of {sector_size} bytes")]
    Geometry { sectors: Sector, sector_size: usize },

    #[error("Port {port}: {what} timed out")]
    Timeout { port: usize, what: &'static str },

    #[error("Port {port}: device error (task file {tfd:#x})")]
    DeviceError { port: usize, tfd: u32 },

    #[error("Controller misconfigured: {0}")]
    Config(String),

    #[error("Failed to spawn interrupt thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Hardware resource error: {0}")]
    Hw(#[from] vrt_hw::HwError),
}

pub type Result<T> = core::result::Result<T, StorageError>;
