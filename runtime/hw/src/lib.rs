//! Hardware Resources - Typed access to device memory, interrupts and DMA
//!
//! # Purpose
//! Drivers never touch raw physical addresses. Everything a driver needs
//! from the machine is handed out by a [`ResourceBroker`] as an owned,
//! validated resource object: register regions with bounds-checked
//! accessors, interrupt lines a thread can block on, and DMA memory with a
//! known physical address.
//!
//! # Integration Points
//! - Depends on: host microkernel (mapping, GSI delivery)
//! - Provides to: storage drivers and any other backend controller
//! - IPC endpoints: None
//! - Capabilities required: device memory and GSI capabilities of the device
//!
//! # Architecture
//! - [`RegisterIo`]: 32-bit register access at byte offsets, implemented by
//!   the host glue over its mappings
//! - [`IrqLine`] / [`IrqTrigger`]: blocking interrupt delivery
//! - [`DmaRegion`]: physically contiguous, identity-translated buffers
//!
//! # Testing Strategy
//! - Unit tests: DMA bounds and alignment, IRQ event delivery
//! - Integration tests: a host-memory broker driving register windows,
//!   interrupt threads and DMA accessors

mod dma;
mod irq;
mod mmio;

use std::sync::Arc;

use thiserror::Error;

pub use dma::DmaRegion;
pub use irq::{AckFn, IrqEvent, IrqLine, IrqTrigger};
pub use mmio::RegisterIo;

/// Error types for hardware resource operations
#[derive(Debug, Error)]
pub enum HwError {
    #[error("Invalid region: base {base:#x}, size {size:#x}")]
    InvalidRegion { base: usize, size: usize },

    #[error("Access at {offset:#x} (+{len}) outside region of {size:#x} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("Invalid alignment {align} (must be a power of two)")]
    InvalidAlignment { align: usize },

    #[error("Out of DMA memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("IRQ {gsi} already claimed")]
    IrqAlreadyAllocated { gsi: u32 },

    #[error("No device memory at {paddr:#x}")]
    NoSuchRegion { paddr: usize },
}

pub type Result<T> = core::result::Result<T, HwError>;

/// Source of hardware resources for a driver
///
/// The host microkernel implements this on top of its memory and interrupt
/// capabilities. Tests implement it with simulated devices.
pub trait ResourceBroker {
    /// Map `size` bytes of device memory at physical address `paddr`
    fn map_mmio(&self, paddr: usize, size: usize) -> Result<Arc<dyn RegisterIo>>;

    /// Attach to the global system interrupt `gsi`
    fn request_irq(&self, gsi: u32) -> Result<IrqLine>;

    /// Allocate physically contiguous, zeroed DMA memory
    fn allocate_dma(&self, size: usize, align: usize) -> Result<DmaRegion> {
        DmaRegion::allocate(size, align)
    }
}
