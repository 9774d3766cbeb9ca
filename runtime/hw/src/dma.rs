//! DMA memory
//!
//! A DMA region is physically contiguous memory shared between a driver and
//! its device. The device may read or write it at any time while a command
//! is in flight, so the driver never holds Rust references into it; all
//! access goes through copying accessors with bounds checks.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::{HwError, Result};

/// DMA memory region with virtual and physical address
#[derive(Debug)]
pub struct DmaRegion {
    ptr: NonNull<u8>,
    paddr: usize,
    size: usize,
    /// Layout of the allocation if this region owns its memory
    layout: Option<Layout>,
}

// SAFETY: the region is plain memory; all access is through raw copies.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate zeroed, identity-translated DMA memory
    ///
    /// # Errors
    /// Returns error if `align` is not a power of two, `size` is zero, or
    /// the allocation fails.
    pub fn allocate(size: usize, align: usize) -> Result<Self> {
        if !align.is_power_of_two() {
            return Err(HwError::InvalidAlignment { align });
        }
        if size == 0 {
            return Err(HwError::OutOfMemory { requested: size });
        }
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| HwError::OutOfMemory { requested: size })?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(HwError::OutOfMemory { requested: size })?;

        Ok(Self {
            ptr,
            paddr: raw as usize,
            size,
            layout: Some(layout),
        })
    }

    /// Wrap memory the host already mapped for DMA
    ///
    /// # Safety
    /// `vaddr..vaddr + size` must be mapped, writable, backed by the
    /// physically contiguous range starting at `paddr`, and outlive the
    /// region.
    pub unsafe fn from_raw(vaddr: usize, paddr: usize, size: usize) -> Result<Self> {
        let ptr = NonNull::new(vaddr as *mut u8)
            .ok_or(HwError::InvalidRegion { base: vaddr, size })?;
        if size == 0 {
            return Err(HwError::InvalidRegion { base: vaddr, size });
        }
        Ok(Self {
            ptr,
            paddr,
            size,
            layout: None,
        })
    }

    /// Virtual address
    pub fn vaddr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Physical address
    pub fn paddr(&self) -> usize {
        self.paddr
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Physical address of the byte at `offset`
    pub fn paddr_at(&self, offset: usize) -> Result<usize> {
        self.check(offset, 0)?;
        Ok(self.paddr + offset)
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the region
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: range checked; source and destination cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked; source and destination cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Zero `len` bytes starting at `offset`
    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        // SAFETY: range checked.
        unsafe {
            core::ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len);
        }
        Ok(())
    }

    /// Store a plain-old-data value at `offset` with a volatile write
    ///
    /// # Errors
    /// Returns error if the value does not fit or `offset` is misaligned
    /// for `T`.
    pub fn store<T: Copy>(&self, offset: usize, value: T) -> Result<()> {
        self.check_typed::<T>(offset)?;
        // SAFETY: range and alignment checked.
        unsafe {
            core::ptr::write_volatile(self.ptr.as_ptr().add(offset) as *mut T, value);
        }
        Ok(())
    }

    /// Load a plain-old-data value from `offset` with a volatile read
    pub fn load<T: Copy>(&self, offset: usize) -> Result<T> {
        self.check_typed::<T>(offset)?;
        // SAFETY: range and alignment checked; callers only use this with
        // types for which every bit pattern is valid.
        Ok(unsafe { core::ptr::read_volatile(self.ptr.as_ptr().add(offset) as *const T) })
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HwError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn check_typed<T>(&self, offset: usize) -> Result<()> {
        self.check(offset, core::mem::size_of::<T>())?;
        let align = core::mem::align_of::<T>();
        if (self.vaddr() + offset) % align != 0 {
            return Err(HwError::InvalidAlignment { align });
        }
        Ok(())
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `allocate` with exactly this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}
