//! Backend controller abstraction
//!
//! Every storage backend implements [`Controller`]. Commands are
//! asynchronous: a submission either fails synchronously or is accepted, and
//! every accepted command is reported exactly once to the [`Producer`] it
//! was submitted with, carrying the caller's [`Tag`]. The one exception is
//! teardown: commands still in flight when a controller is dropped are
//! abandoned without a completion.

use std::sync::Arc;

use bitflags::bitflags;
use crossbeam::channel::{self, Receiver, Sender};
use vrt_hw::DmaRegion;

use crate::{Result, StorageError};

/// Caller-chosen correlation token
pub type Tag = u64;

/// Sector number or count
pub type Sector = u64;

bitflags! {
    /// Drive capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriveFlags: u32 {
        /// Drive is present and usable
        const PRESENT = 1 << 0;
        /// 48-bit LBA addressing
        const LBA48 = 1 << 1;
        /// Cache flush supported
        const FLUSH = 1 << 2;
        /// Transfers by DMA
        const DMA = 1 << 3;
    }
}

/// Geometry and capabilities of one drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveParams {
    pub flags: DriveFlags,
    /// Capacity in sectors
    pub sectors: Sector,
    /// Bytes per sector
    pub sector_size: usize,
    /// Largest sector count of a single request
    pub max_sectors: Sector,
    /// Model string reported by the drive
    pub name: String,
}

/// Outcome of a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The device reported an error; `status` is the raw port status
    Failed { status: u32 },
}

/// Completion record delivered to a [`CompletionQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tag: Tag,
    pub status: CompletionStatus,
}

/// Completion sink
///
/// Invoked exactly once per accepted command, from the backend's completion
/// context (typically its interrupt thread). Implementations must not block.
pub trait Producer: Send + Sync {
    fn complete(&self, tag: Tag, status: CompletionStatus);
}

/// Producer that forwards completions into a channel
#[derive(Debug)]
pub struct CompletionQueue {
    tx: Sender<Completion>,
}

impl CompletionQueue {
    /// Create a queue and the receiver its completions arrive on
    pub fn new() -> (Arc<Self>, Receiver<Completion>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl Producer for CompletionQueue {
    fn complete(&self, tag: Tag, status: CompletionStatus) {
        if self.tx.send(Completion { tag, status }).is_err() {
            log::warn!("completion for tag {:#x} dropped, consumer is gone", tag);
        }
    }
}

/// Data transfer part of a read or write request
#[derive(Debug, Clone)]
pub struct Transfer {
    /// DMA buffer the data is transferred from or to
    pub buffer: Arc<DmaRegion>,
    /// Byte offset into `buffer`
    pub offset: usize,
    /// First sector on the drive
    pub sector: Sector,
    /// Number of sectors
    pub count: Sector,
}

impl Transfer {
    pub fn new(buffer: Arc<DmaRegion>, offset: usize, sector: Sector, count: Sector) -> Self {
        Self {
            buffer,
            offset,
            sector,
            count,
        }
    }

    /// Validate the transfer against a drive and return its size in bytes
    pub fn validate(&self, params: &DriveParams) -> Result<usize> {
        if self.count == 0 {
            return Err(StorageError::EmptyTransfer);
        }
        if self.count > params.max_sectors {
            return Err(StorageError::TooLarge {
                count: self.count,
                max: params.max_sectors,
            });
        }
        match self.sector.checked_add(self.count) {
            Some(end) if end <= params.sectors => {}
            _ => {
                return Err(StorageError::OutOfRange {
                    sector: self.sector,
                    count: self.count,
                    capacity: params.sectors,
                })
            }
        }

        let bytes = usize::try_from(self.count)
            .ok()
            .and_then(|count| count.checked_mul(params.sector_size))
            .ok_or(StorageError::TooLarge {
                count: self.count,
                max: params.max_sectors,
            })?;
        let available = self.buffer.size().saturating_sub(self.offset);
        if bytes > available {
            return Err(StorageError::BufferTooSmall {
                needed: bytes,
                available,
            });
        }
        Ok(bytes)
    }
}

/// Block storage backend capability
pub trait Controller: Send + Sync {
    /// Check whether `drive` exists
    fn exists(&self, drive: usize) -> bool;

    /// Number of drives; stable after start-up
    fn drive_count(&self) -> usize;

    /// Geometry of `drive`
    fn get_params(&self, drive: usize) -> Result<DriveParams>;

    /// Flush the drive's write cache
    fn flush(&self, drive: usize, producer: Arc<dyn Producer>, tag: Tag) -> Result<()>;

    /// Read `transfer.count` sectors into the buffer
    fn read(
        &self,
        drive: usize,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()>;

    /// Write `transfer.count` sectors from the buffer
    fn write(
        &self,
        drive: usize,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()>;
}
