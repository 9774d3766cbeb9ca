//! MMIO - Register access seam
//!
//! Drivers reach device registers only through [`RegisterIo`]. The host
//! glue implements it over the mapping it created for a BAR; tests
//! implement it with simulated devices that model the register semantics.
//! Implementations own the bounds of their window: an access outside
//! `0..size()` is a driver bug and must not reach other memory.

/// 32-bit register access at byte offsets within a region
pub trait RegisterIo: Send + Sync {
    /// Size of the region in bytes
    fn size(&self) -> usize;

    /// Read the 32-bit register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset`
    fn write32(&self, offset: usize, value: u32);
}
