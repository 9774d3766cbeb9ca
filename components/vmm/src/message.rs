//! Message types of the motherboard buses
//!
//! One type per request or event category. Requests carry their answer
//! fields; the receiver that claims a message fills them in.

use std::sync::Arc;

use vrt_base::TimeValue;
use vrt_hw::DmaRegion;
use vrt_storage::{CompletionStatus, DriveParams, Sector, Tag};

/// Operation of a [`MessageDisk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOp {
    GetParams,
    Read,
    Write,
    FlushCache,
}

/// Synchronous result of a [`MessageDisk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    /// Accepted; a [`MessageDiskCommit`] follows for transfers and flushes
    Ok,
    /// The backend queue is full; retry later
    Busy,
    /// Rejected: bad range, missing buffer, backend error
    Fault,
    /// The drive cannot perform this operation
    Unsupported,
}

/// Disk request addressed to disk `disk`
#[derive(Debug, Clone)]
pub struct MessageDisk {
    pub op: DiskOp,
    pub disk: u64,
    /// Correlation token returned in the commit
    pub usertag: Tag,
    pub sector: Sector,
    pub count: Sector,
    pub buffer: Option<Arc<DmaRegion>>,
    /// Byte offset into `buffer`
    pub offset: usize,
    /// Filled in by [`DiskOp::GetParams`]
    pub params: Option<DriveParams>,
    pub status: DiskStatus,
}

impl MessageDisk {
    fn new(op: DiskOp, disk: u64, usertag: Tag) -> Self {
        Self {
            op,
            disk,
            usertag,
            sector: 0,
            count: 0,
            buffer: None,
            offset: 0,
            params: None,
            status: DiskStatus::Fault,
        }
    }

    pub fn get_params(disk: u64) -> Self {
        Self::new(DiskOp::GetParams, disk, 0)
    }

    pub fn flush(disk: u64, usertag: Tag) -> Self {
        Self::new(DiskOp::FlushCache, disk, usertag)
    }

    /// Read `count` sectors at `sector` into `buffer` at `offset`
    pub fn read(
        disk: u64,
        usertag: Tag,
        sector: Sector,
        count: Sector,
        buffer: Arc<DmaRegion>,
        offset: usize,
    ) -> Self {
        Self::transfer(DiskOp::Read, disk, usertag, sector, count, buffer, offset)
    }

    /// Write `count` sectors at `sector` from `buffer` at `offset`
    pub fn write(
        disk: u64,
        usertag: Tag,
        sector: Sector,
        count: Sector,
        buffer: Arc<DmaRegion>,
        offset: usize,
    ) -> Self {
        Self::transfer(DiskOp::Write, disk, usertag, sector, count, buffer, offset)
    }

    fn transfer(
        op: DiskOp,
        disk: u64,
        usertag: Tag,
        sector: Sector,
        count: Sector,
        buffer: Arc<DmaRegion>,
        offset: usize,
    ) -> Self {
        Self {
            sector,
            count,
            buffer: Some(buffer),
            offset,
            ..Self::new(op, disk, usertag)
        }
    }
}

/// Completion of an accepted disk request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDiskCommit {
    pub disk: u64,
    pub usertag: Tag,
    pub status: CompletionStatus,
}

/// Interrupt raised by a host device on GSI `gsi`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHostIrq {
    pub gsi: u32,
}

/// Change of a guest interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqLineOp {
    Assert,
    Deassert,
    /// Assert and request a notification once the guest acknowledges
    AssertNotify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIrqLines {
    pub line: u8,
    pub op: IrqLineOp,
}

/// End-of-interrupt notification for `mask` lines starting at `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIrqNotify {
    pub base: u8,
    pub mask: u8,
}

/// Guest port read; the claiming device fills in `value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIoIn {
    pub port: u16,
    /// Access width in bytes: 1, 2 or 4
    pub width: u8,
    pub value: u32,
}

impl MessageIoIn {
    pub fn new(port: u16, width: u8) -> Self {
        Self {
            port,
            width,
            value: !0,
        }
    }
}

/// Guest port write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIoOut {
    pub port: u16,
    pub width: u8,
    pub value: u32,
}

/// Guest physical memory access to device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMem {
    pub read: bool,
    pub phys: u64,
    /// Value written, or filled in on reads
    pub value: u32,
}

/// Wall-clock request; the claiming device fills in both fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageTime {
    /// Microseconds since the Unix epoch
    pub wallclock: u64,
    /// Motherboard clock value `wallclock` was taken at
    pub timestamp: TimeValue,
}

/// Virtual timer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    /// Allocate a timer; its number is returned in `nr`
    New,
    /// Fire timer `nr` at `abstime` (motherboard clock ticks)
    Request { abstime: TimeValue },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTimer {
    pub op: TimerOp,
    pub nr: usize,
}

/// Timer `nr` expired at `time`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTimeout {
    pub nr: usize,
    pub time: TimeValue,
}

/// Requests to the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    /// Route host GSI `gsi` to the VM
    AttachIrq { gsi: u32 },
    /// Grant direct access to `count` I/O ports at `base`
    AllocIoPorts { base: u16, count: u16 },
    /// Map `size` bytes of host device memory at `phys`
    AllocIoMem { phys: u64, size: u64 },
    /// Number of virtual CPUs, returned in `value`
    VcpuCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHostOp {
    pub op: HostOp,
    /// Result of the operation, if it has one
    pub value: u64,
}

impl MessageHostOp {
    pub fn new(op: HostOp) -> Self {
        Self { op, value: 0 }
    }
}
