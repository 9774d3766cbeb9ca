//! AHCI port - command slot tracking for one drive
//!
//! Submitters and the interrupt thread share a port without a lock. Two
//! bitmaps carry the protocol:
//! - `claimed`: slots reserved by a submitter; set by submitters with a CAS,
//!   cleared only by the interrupt thread after completion
//! - `issued`: slots handed to the HBA whose completion is still owed; set
//!   by the submitter after writing PxCI, cleared only by the interrupt thread
//!
//! A slot is free when it is neither claimed nor busy in PxCI/PxSACT. The
//! interrupt thread completes exactly the slots that are issued but no
//! longer set in PxCI, and is the only code path that touches PxIS or
//! delivers completions. Once the HBA reports an error the port stays
//! faulted; reset is left to the owner of the controller.
//!
//! A port stops its command engine when dropped, before its command list
//! and FIS area are released.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vrt_base::SpinLock;
use vrt_hw::{DmaRegion, IrqTrigger, ResourceBroker};

use super::fis::{
    self, CmdHeader, Direction, FisRegH2D, PrdtEntry, CMD_HEADER_SIZE, CMD_LIST_ALIGN, CMD_LIST_SIZE,
    CMD_TABLE_ALIGN, CMD_TABLE_SIZE, FIS_AREA_ALIGN, FIS_AREA_SIZE, IDENTIFY_SIZE, PRDT_ENTRY_SIZE,
    PRDT_OFFSET,
};
use super::regs::{Capabilities, PortCmd, PortIrq, PortRegs, SIG_ATA, TFD_BSY, TFD_DRQ, TFD_ERR};
use crate::{
    CompletionStatus, DriveFlags, DriveParams, Producer, Result, StorageError, Tag, Transfer,
};

/// Completion owed for an issued slot
struct Pending {
    producer: Arc<dyn Producer>,
    tag: Tag,
    /// Keeps the data buffer alive while the HBA may access it
    _buffer: Option<Arc<DmaRegion>>,
}

/// One implemented port with an attached ATA drive
pub struct AhciPort {
    nr: usize,
    drive: usize,
    regs: PortRegs,
    params: DriveParams,
    mask: u32,
    clist: DmaRegion,
    _fis: DmaRegion,
    tables: DmaRegion,
    claimed: AtomicU32,
    issued: AtomicU32,
    /// Error status latched by the interrupt thread
    fault: AtomicU32,
    pending: Box<[SpinLock<Option<Pending>>]>,
    kick: IrqTrigger,
    spins: usize,
}

impl AhciPort {
    /// Bring up port `nr` and identify its drive
    ///
    /// The link of a detected device is reset (COMRESET) with the engine
    /// stopped. Returns `Ok(None)` if no ATA drive is attached. Runs before
    /// the interrupt thread exists, so it polls for the IDENTIFY completion.
    pub fn probe(
        nr: usize,
        drive: usize,
        regs: PortRegs,
        broker: &dyn ResourceBroker,
        caps: Capabilities,
        spins: usize,
        kick: IrqTrigger,
    ) -> Result<Option<Self>> {
        if !regs.device_detected() {
            return Ok(None);
        }
        stop_engine(&regs, nr, spins)?;
        reset_link(&regs, nr, spins)?;

        let signature = regs.signature();
        if signature != SIG_ATA {
            log::info!("AHCI port {}: skipping device with signature {:#x}", nr, signature);
            return Ok(None);
        }
        regs.disable_fis_switching();

        let clist = broker.allocate_dma(CMD_LIST_SIZE, CMD_LIST_ALIGN)?;
        let fis_area = broker.allocate_dma(FIS_AREA_SIZE, FIS_AREA_ALIGN)?;
        let tables = broker.allocate_dma(caps.slots * CMD_TABLE_SIZE, CMD_TABLE_ALIGN)?;
        if !caps.addr64 {
            let highest = [&clist, &fis_area, &tables]
                .iter()
                .map(|r| r.paddr() + r.size())
                .max()
                .unwrap_or(0);
            if highest > u32::MAX as usize {
                return Err(StorageError::Config(format!(
                    "port {}: DMA memory above 4 GiB on a 32-bit HBA",
                    nr
                )));
            }
        }

        regs.set_command_list(clist.paddr() as u64);
        regs.set_fis_base(fis_area.paddr() as u64);
        regs.clear_errors();
        regs.clear_notifications();
        regs.clear_interrupts(PortIrq::all());

        let slots = caps.slots;
        let mut port = Self {
            nr,
            drive,
            regs,
            params: DriveParams {
                flags: DriveFlags::empty(),
                sectors: 0,
                sector_size: 512,
                max_sectors: 0,
                name: String::new(),
            },
            mask: if slots >= 32 { u32::MAX } else { (1 << slots) - 1 },
            clist,
            _fis: fis_area,
            tables,
            claimed: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            fault: AtomicU32::new(0),
            pending: (0..slots).map(|_| SpinLock::new(None)).collect(),
            kick,
            spins,
        };
        // From here on a failure drops the port, which stops it again
        port.start()?;
        port.params = port.identify(broker, spins)?;
        log::info!(
            "AHCI port {}: drive {} \"{}\" {} sectors of {} bytes {:?}",
            nr,
            drive,
            port.params.name,
            port.params.sectors,
            port.params.sector_size,
            port.params.flags
        );
        Ok(Some(port))
    }

    /// Enable FIS reception and command processing
    fn start(&self) -> Result<()> {
        let regs = &self.regs;
        regs.set_cmd(regs.cmd() | PortCmd::FRE);
        wait_for(self.spins, || regs.task_file() & (TFD_BSY | TFD_DRQ) == 0).ok_or(
            StorageError::Timeout {
                port: self.nr,
                what: "device ready",
            },
        )?;
        regs.set_cmd(regs.cmd() | PortCmd::ST);
        regs.enable_interrupts(PortIrq::ENABLED);
        Ok(())
    }

    fn identify(&self, broker: &dyn ResourceBroker, spins: usize) -> Result<DriveParams> {
        let buffer = broker.allocate_dma(IDENTIFY_SIZE, 512)?;
        let prdt = [PrdtEntry::new(buffer.paddr() as u64, IDENTIFY_SIZE, true)];
        self.build(0, FisRegH2D::command(fis::ATA_IDENTIFY), &prdt, false)?;
        fence(Ordering::SeqCst);
        self.regs.issue(1);

        let done = wait_for(spins, || {
            self.regs.commands_issued() & 1 == 0
                || self.regs.interrupt_status().intersects(PortIrq::ERROR)
        });
        let status = self.regs.interrupt_status();
        self.regs.clear_interrupts(status);
        if done.is_none() {
            return Err(StorageError::Timeout {
                port: self.nr,
                what: "IDENTIFY",
            });
        }
        let tfd = self.regs.task_file();
        if status.intersects(PortIrq::ERROR) || tfd & TFD_ERR != 0 {
            return Err(StorageError::DeviceError { port: self.nr, tfd });
        }

        let mut data = [0u8; IDENTIFY_SIZE];
        buffer.read(0, &mut data)?;
        Ok(fis::parse_identify(&data))
    }

    /// HBA port number
    pub fn nr(&self) -> usize {
        self.nr
    }

    pub fn params(&self) -> &DriveParams {
        &self.params
    }

    /// Number of command slots
    pub fn slots(&self) -> usize {
        self.pending.len()
    }

    /// Submit a cache flush
    pub fn flush(&self, producer: Arc<dyn Producer>, tag: Tag) -> Result<()> {
        let command = FisRegH2D::command(fis::flush_opcode(self.params.flags));
        self.submit(command, &[], false, producer, tag, None)
    }

    /// Submit a read or write of `transfer`
    pub fn transfer(
        &self,
        direction: Direction,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()> {
        let bytes = transfer.validate(&self.params)?;
        let paddr = transfer.buffer.paddr_at(transfer.offset)? as u64;
        let prdt = fis::build_prdt(paddr, bytes).ok_or(StorageError::TooLarge {
            count: transfer.count,
            max: self.params.max_sectors,
        })?;
        let opcode = fis::transfer_opcode(direction, self.params.flags);
        let command = FisRegH2D::lba(opcode, transfer.sector, transfer.count);
        self.submit(
            command,
            &prdt,
            direction == Direction::Write,
            producer,
            tag,
            Some(transfer.buffer),
        )
    }

    fn submit(
        &self,
        command: FisRegH2D,
        prdt: &[PrdtEntry],
        write: bool,
        producer: Arc<dyn Producer>,
        tag: Tag,
        buffer: Option<Arc<DmaRegion>>,
    ) -> Result<()> {
        let slot = self.claim()?;
        let bit = 1u32 << slot;
        if let Err(err) = self.build(slot, command, prdt, write) {
            self.claimed.fetch_and(!bit, Ordering::AcqRel);
            return Err(err);
        }
        *self.pending[slot].lock() = Some(Pending {
            producer,
            tag,
            _buffer: buffer,
        });

        // Command table and record must be visible before the HBA sees CI
        fence(Ordering::SeqCst);
        self.regs.issue(bit);
        self.issued.fetch_or(bit, Ordering::SeqCst);
        log::trace!("AHCI port {}: tag {:#x} issued in slot {}", self.nr, tag, slot);

        // An interrupt for this slot may have been serviced before `issued`
        // had the bit; hand the completion to the interrupt thread.
        if self.regs.commands_issued() & bit == 0 || self.fault.load(Ordering::SeqCst) != 0 {
            self.kick.kick();
        }
        Ok(())
    }

    fn claim(&self) -> Result<usize> {
        if self.is_faulted() {
            return Err(StorageError::DeviceError {
                port: self.nr,
                tfd: self.regs.task_file(),
            });
        }
        loop {
            let claimed = self.claimed.load(Ordering::Acquire);
            let busy = claimed | self.regs.commands_issued() | self.regs.active();
            let free = !busy & self.mask;
            if free == 0 {
                return Err(StorageError::QueueFull { drive: self.drive });
            }
            let slot = free.trailing_zeros();
            if self
                .claimed
                .compare_exchange(claimed, claimed | 1 << slot, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(slot as usize);
            }
        }
    }

    fn build(&self, slot: usize, command: FisRegH2D, prdt: &[PrdtEntry], write: bool) -> Result<()> {
        let table = slot * CMD_TABLE_SIZE;
        self.tables.zero(table, CMD_TABLE_SIZE)?;
        self.tables.store(table, command)?;
        for (i, entry) in prdt.iter().enumerate() {
            self.tables.store(table + PRDT_OFFSET + i * PRDT_ENTRY_SIZE, *entry)?;
        }
        let ctba = self.tables.paddr_at(table)? as u64;
        self.clist
            .store(slot * CMD_HEADER_SIZE, CmdHeader::new(ctba, prdt.len(), write))?;
        Ok(())
    }

    /// Deliver completions for finished slots
    ///
    /// Interrupt thread only. A port error latches the port as faulted:
    /// every slot still busy in PxCI fails, now and for commands whose
    /// issue raced with the error, and new submissions are rejected until
    /// the port is reset.
    pub fn handle_interrupt(&self) {
        let status = self.regs.interrupt_status();
        if !status.is_empty() {
            self.regs.clear_interrupts(status);
        }
        if status.intersects(PortIrq::ERROR) {
            log::warn!(
                "AHCI port {}: error status {:#x}, task file {:#x}",
                self.nr,
                status.bits(),
                self.regs.task_file()
            );
            self.fault.fetch_or(status.bits(), Ordering::SeqCst);
        }

        let issued = self.issued.load(Ordering::SeqCst);
        if issued == 0 {
            return;
        }
        let ci = self.regs.commands_issued();
        let fault = self.fault.load(Ordering::SeqCst);

        let mut remaining = issued;
        while remaining != 0 {
            let slot = remaining.trailing_zeros() as usize;
            let bit = 1u32 << slot;
            remaining &= !bit;

            let outcome = if ci & bit == 0 {
                CompletionStatus::Success
            } else if fault != 0 {
                CompletionStatus::Failed { status: fault }
            } else {
                continue;
            };

            let Some(pending) = self.pending[slot].lock().take() else {
                continue;
            };
            self.issued.fetch_and(!bit, Ordering::AcqRel);
            self.claimed.fetch_and(!bit, Ordering::AcqRel);
            pending.producer.complete(pending.tag, outcome);
        }
    }

    /// Whether an error stopped the port
    pub fn is_faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire) != 0
    }

    /// Stop command processing and FIS reception
    pub fn stop(&self) {
        self.regs.enable_interrupts(PortIrq::empty());
        if let Err(err) = stop_engine(&self.regs, self.nr, self.spins) {
            log::warn!("{}", err);
        }
    }
}

impl Drop for AhciPort {
    fn drop(&mut self) {
        self.stop();
        log::debug!("AHCI port {}: stopped", self.nr);
    }
}

/// Reset the SATA link and wait for the device to come back
fn reset_link(regs: &PortRegs, nr: usize, spins: usize) -> Result<()> {
    regs.set_comreset(true);
    // COMRESET must be held for at least 1 ms
    thread::sleep(Duration::from_millis(1));
    regs.set_comreset(false);
    wait_for(spins, || regs.device_detected()).ok_or(StorageError::Timeout {
        port: nr,
        what: "link up after COMRESET",
    })?;
    regs.clear_errors();
    Ok(())
}

fn stop_engine(regs: &PortRegs, nr: usize, spins: usize) -> Result<()> {
    regs.set_cmd(regs.cmd() - PortCmd::ST);
    wait_for(spins, || !regs.cmd().contains(PortCmd::CR)).ok_or(StorageError::Timeout {
        port: nr,
        what: "command list stop",
    })?;
    regs.set_cmd(regs.cmd() - PortCmd::FRE);
    wait_for(spins, || !regs.cmd().contains(PortCmd::FR)).ok_or(StorageError::Timeout {
        port: nr,
        what: "FIS receive stop",
    })?;
    Ok(())
}

/// Spin until `cond` holds, at most `spins` rounds
fn wait_for(spins: usize, mut cond: impl FnMut() -> bool) -> Option<()> {
    for _ in 0..=spins {
        if cond() {
            return Some(());
        }
        std::hint::spin_loop();
    }
    None
}
