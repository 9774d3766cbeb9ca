//! Host disk - A guest disk backed by a drive of a storage backend
//!
//! Claims [`MessageDisk`] requests for its disk number and submits them to
//! the backend with the request's user tag. The backend completes from its
//! own context, possibly another thread, so completions are queued and
//! turned into [`MessageDiskCommit`]s only when the thread owning the
//! motherboard calls [`HostDisks::commit_pending`].
//!
//! Command line: `hostdisk:<disk>,<drive>`; `drive` defaults to `disk`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crossbeam::channel::Receiver as CompletionReceiver;
use vrt_storage::{
    Completion, CompletionQueue, Controller, DriveFlags, DriveParams, Producer, StorageError,
    Transfer,
};

use crate::message::{DiskOp, DiskStatus, MessageDisk, MessageDiskCommit};
use crate::{DeviceRegistry, Motherboard, Receiver, Result, VmmError, ARG_MISSING};

const DEVICE: &str = "hostdisk";

/// Guest disk `disk` on backend drive `drive`
pub struct HostDisk {
    disk: u64,
    drive: usize,
    backend: Arc<dyn Controller>,
    params: DriveParams,
    queue: Arc<CompletionQueue>,
    completions: CompletionReceiver<Completion>,
}

impl HostDisk {
    pub fn new(disk: u64, drive: usize, backend: Arc<dyn Controller>) -> Result<Self> {
        let params = backend.get_params(drive)?;
        let (queue, completions) = CompletionQueue::new();
        log::info!(
            "{}: disk {} -> drive {} '{}' ({} sectors of {} bytes)",
            DEVICE,
            disk,
            drive,
            params.name,
            params.sectors,
            params.sector_size
        );
        Ok(Self {
            disk,
            drive,
            backend,
            params,
            queue,
            completions,
        })
    }

    pub fn disk(&self) -> u64 {
        self.disk
    }

    pub fn params(&self) -> &DriveParams {
        &self.params
    }

    /// Publish the commits of all completed requests, returning their number
    pub fn commit_pending(&self, mb: &Motherboard) -> usize {
        let mut committed = 0;
        for completion in self.completions.try_iter() {
            let mut commit = MessageDiskCommit {
                disk: self.disk,
                usertag: completion.tag,
                status: completion.status,
            };
            if !mb.bus_diskcommit().publish(&mut commit) {
                log::debug!(
                    "{}: commit of tag {:#x} on disk {} unclaimed",
                    DEVICE,
                    completion.tag,
                    self.disk
                );
            }
            committed += 1;
        }
        committed
    }

    fn producer(&self) -> Arc<dyn Producer> {
        self.queue.clone()
    }

    fn transfer(msg: &MessageDisk) -> vrt_storage::Result<Transfer> {
        let buffer = msg.buffer.clone().ok_or(StorageError::EmptyTransfer)?;
        Ok(Transfer::new(buffer, msg.offset, msg.sector, msg.count))
    }

    /// Status of a submission to the backend
    fn status(&self, op: DiskOp, result: vrt_storage::Result<()>) -> DiskStatus {
        match result {
            Ok(()) => DiskStatus::Ok,
            Err(StorageError::QueueFull { .. }) => DiskStatus::Busy,
            Err(err) => {
                log::warn!("{}: disk {} {:?}: {}", DEVICE, self.disk, op, err);
                DiskStatus::Fault
            }
        }
    }
}

impl Receiver<MessageDisk> for HostDisk {
    fn receive(&self, msg: &mut MessageDisk) -> bool {
        if msg.disk != self.disk {
            return false;
        }
        let tag = msg.usertag;
        msg.status = match msg.op {
            DiskOp::GetParams => {
                msg.params = Some(self.params.clone());
                DiskStatus::Ok
            }
            DiskOp::FlushCache if !self.params.flags.contains(DriveFlags::FLUSH) => {
                log::debug!("{}: disk {} has no cache to flush", DEVICE, self.disk);
                DiskStatus::Unsupported
            }
            DiskOp::FlushCache => {
                let result = self.backend.flush(self.drive, self.producer(), tag);
                self.status(msg.op, result)
            }
            DiskOp::Read => {
                let result = Self::transfer(msg)
                    .and_then(|xfer| self.backend.read(self.drive, self.producer(), tag, xfer));
                self.status(msg.op, result)
            }
            DiskOp::Write => {
                let result = Self::transfer(msg)
                    .and_then(|xfer| self.backend.write(self.drive, self.producer(), tag, xfer));
                self.status(msg.op, result)
            }
        };
        true
    }
}

/// Host disks created through a [`DeviceRegistry`]
#[derive(Clone, Default)]
pub struct HostDisks {
    disks: Rc<RefCell<Vec<Rc<HostDisk>>>>,
}

impl HostDisks {
    /// Register the `hostdisk` device on `registry`, backed by `backend`
    pub fn register(registry: &mut DeviceRegistry, backend: Arc<dyn Controller>) -> Result<Self> {
        let disks = Self::default();
        let list = disks.clone();
        registry.register(
            DEVICE,
            "hostdisk:disk,drive - attach a backend drive (default: drive = disk) as guest disk",
            move |mb, argv, _| {
                let disk = argv[0];
                if disk == ARG_MISSING {
                    return Err(VmmError::MissingArgument {
                        device: DEVICE,
                        index: 0,
                    });
                }
                if list.get(disk).is_some() {
                    return Err(VmmError::DiskInUse {
                        device: DEVICE,
                        disk,
                    });
                }
                let drive = if argv[1] == ARG_MISSING { disk } else { argv[1] };
                let drive = usize::try_from(drive)
                    .ok()
                    .filter(|&d| backend.exists(d))
                    .ok_or(StorageError::NoSuchDrive {
                        drive: drive as usize,
                    })?;

                let device = Rc::new(HostDisk::new(disk, drive, Arc::clone(&backend))?);
                mb.bus_disk().subscribe(device.clone());
                list.disks.borrow_mut().push(device);
                Ok(())
            },
        )?;
        Ok(disks)
    }

    /// Host disk with guest number `disk`
    pub fn get(&self, disk: u64) -> Option<Rc<HostDisk>> {
        self.disks.borrow().iter().find(|d| d.disk == disk).cloned()
    }

    /// Guest numbers of the created disks, in creation order
    pub fn numbers(&self) -> Vec<u64> {
        self.disks.borrow().iter().map(|d| d.disk).collect()
    }

    pub fn len(&self) -> usize {
        self.disks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.borrow().is_empty()
    }

    /// Publish the pending commits of every disk
    pub fn commit_pending(&self, mb: &Motherboard) -> usize {
        // Snapshot so commit receivers may create devices
        let disks = self.disks.borrow().clone();
        disks.iter().map(|disk| disk.commit_pending(mb)).sum()
    }
}
