//! Memory disk - A backend kept entirely in host memory
//!
//! Commands complete synchronously: the producer is invoked before the
//! submitting call returns. Used where no storage hardware is available and
//! as the reference backend for the device model.

use std::sync::Arc;

use vrt_base::SpinLock;

use crate::{
    CompletionStatus, Controller, DriveFlags, DriveParams, Producer, Result, StorageError, Tag,
    Transfer,
};

/// Host-memory backend with a single drive
pub struct MemoryDisk {
    params: DriveParams,
    data: SpinLock<Vec<u8>>,
}

impl MemoryDisk {
    /// Create a zero-filled drive of `sectors` sectors of `sector_size` bytes
    ///
    /// # Errors
    /// Returns error if the sector size is zero or the drive does not fit
    /// into the host address space.
    pub fn new(sectors: u64, sector_size: usize) -> Result<Self> {
        let bytes = usize::try_from(sectors)
            .ok()
            .filter(|_| sector_size > 0)
            .and_then(|n| n.checked_mul(sector_size))
            .ok_or(StorageError::Geometry {
                sectors,
                sector_size,
            })?;
        Ok(Self {
            params: DriveParams {
                flags: DriveFlags::PRESENT | DriveFlags::LBA48 | DriveFlags::FLUSH,
                sectors,
                sector_size,
                max_sectors: 0x10000,
                name: "memdisk".into(),
            },
            data: SpinLock::new(vec![0; bytes]),
        })
    }

    fn check_drive(&self, drive: usize) -> Result<()> {
        if !self.exists(drive) {
            return Err(StorageError::NoSuchDrive { drive });
        }
        Ok(())
    }

    fn range(&self, transfer: &Transfer) -> Result<(usize, usize)> {
        let bytes = transfer.validate(&self.params)?;
        let start = transfer.sector as usize * self.params.sector_size;
        Ok((start, bytes))
    }
}

impl Controller for MemoryDisk {
    fn exists(&self, drive: usize) -> bool {
        drive == 0
    }

    fn drive_count(&self) -> usize {
        1
    }

    fn get_params(&self, drive: usize) -> Result<DriveParams> {
        self.check_drive(drive)?;
        Ok(self.params.clone())
    }

    fn flush(&self, drive: usize, producer: Arc<dyn Producer>, tag: Tag) -> Result<()> {
        self.check_drive(drive)?;
        producer.complete(tag, CompletionStatus::Success);
        Ok(())
    }

    fn read(
        &self,
        drive: usize,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()> {
        self.check_drive(drive)?;
        let (start, bytes) = self.range(&transfer)?;
        {
            let data = self.data.lock();
            transfer
                .buffer
                .write(transfer.offset, &data[start..start + bytes])?;
        }
        producer.complete(tag, CompletionStatus::Success);
        Ok(())
    }

    fn write(
        &self,
        drive: usize,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()> {
        self.check_drive(drive)?;
        let (start, bytes) = self.range(&transfer)?;
        {
            let mut data = self.data.lock();
            transfer
                .buffer
                .read(transfer.offset, &mut data[start..start + bytes])?;
        }
        producer.complete(tag, CompletionStatus::Success);
        Ok(())
    }
}
