//! AHCI host bus adapter driver
//!
//! Maps the controller registers, probes every implemented port, and runs a
//! dedicated interrupt thread for the lifetime of the controller. Drives are
//! numbered densely in port order; port numbers with no drive attached are
//! skipped.
//!
//! Dropping the controller stops the interrupt thread, then all ports.
//! Commands still in flight at that point are abandoned: their producers
//! are never invoked.

mod fis;
mod port;
pub mod regs;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use vrt_hw::{IrqEvent, IrqLine, IrqTrigger, ResourceBroker};

use crate::{Controller, DriveParams, Producer, Result, StorageError, Tag, Transfer};

pub use fis::{parse_identify, Direction, IDENTIFY_SIZE};
use port::AhciPort;
use regs::{Ghc, Hba, HIGH_PORTS, HIGH_REGION_SIZE, LOW_REGION_SIZE, MAX_PORTS};

/// Default number of polling rounds before a register wait times out
pub const DEFAULT_POLL_SPINS: usize = 1_000_000;

/// AHCI controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhciConfig {
    /// Physical address of the register BAR (ABAR)
    pub bar: usize,
    /// Interrupt line of the controller
    pub gsi: u32,
    /// Polling rounds for start-up register waits
    pub poll_spins: usize,
}

impl AhciConfig {
    pub fn new(bar: usize, gsi: u32) -> Self {
        Self {
            bar,
            gsi,
            poll_spins: DEFAULT_POLL_SPINS,
        }
    }
}

/// AHCI controller owning its ports and interrupt thread
pub struct AhciController {
    hba: Hba,
    ports: Arc<[AhciPort]>,
    trigger: IrqTrigger,
    irq_thread: Option<JoinHandle<()>>,
}

impl AhciController {
    /// Bring up the controller described by `config`
    ///
    /// Ports that fail to come up are logged and skipped; only register or
    /// interrupt resources that cannot be obtained fail the whole controller.
    /// Ports already started when that happens are stopped again as they
    /// are dropped, and interrupts stay disabled.
    pub fn new(broker: &dyn ResourceBroker, config: &AhciConfig) -> Result<Self> {
        let low = broker.map_mmio(config.bar, LOW_REGION_SIZE)?;
        let implemented = low.read32(regs::PI);
        let high = if implemented & HIGH_PORTS != 0 {
            Some(broker.map_mmio(config.bar + LOW_REGION_SIZE, HIGH_REGION_SIZE)?)
        } else {
            None
        };
        let hba = Hba::new(low, high);

        hba.set_ghc(Ghc::AE);
        if hba.bios_handoff(config.poll_spins) {
            log::warn!("AHCI: firmware did not release the controller, continuing anyway");
        }
        let caps = hba.capabilities();
        log::info!(
            "AHCI: version {:#x}, {} slots, ports implemented {:#010x}",
            hba.read(regs::VS),
            caps.slots,
            implemented
        );
        if caps.coalescing && hba.disable_coalescing() {
            log::info!("AHCI: command completion coalescing disabled");
        }
        if caps.enclosure {
            let (offset, size) = hba.enclosure_buffer();
            log::debug!(
                "AHCI: enclosure management buffer at {:#x} (+{:#x}), control {:#x}",
                offset,
                size,
                hba.enclosure_control()
            );
        }

        let line = broker.request_irq(config.gsi)?;
        let trigger = line.trigger();

        let mut ports = Vec::new();
        for nr in (0..MAX_PORTS).filter(|nr| implemented & (1 << nr) != 0) {
            let regs = hba.port(nr)?;
            match AhciPort::probe(
                nr,
                ports.len(),
                regs,
                broker,
                caps,
                config.poll_spins,
                trigger.clone(),
            ) {
                Ok(Some(port)) => ports.push(port),
                Ok(None) => log::debug!("AHCI port {}: no drive", nr),
                Err(err) => log::warn!("AHCI port {}: {}", nr, err),
            }
        }
        let ports: Arc<[AhciPort]> = ports.into();
        log::info!("AHCI: {} drive(s) active", ports.len());

        hba.clear_interrupts(u32::MAX);
        let irq_thread = thread::Builder::new().name("ahci-irq".into()).spawn({
            let hba = hba.clone();
            let ports = Arc::clone(&ports);
            move || irq_loop(hba, ports, line)
        })?;
        hba.set_ghc(Ghc::IE);

        Ok(Self {
            hba,
            ports,
            trigger,
            irq_thread: Some(irq_thread),
        })
    }

    fn port(&self, drive: usize) -> Result<&AhciPort> {
        self.ports
            .get(drive)
            .ok_or(StorageError::NoSuchDrive { drive })
    }

    /// HBA port number backing `drive`
    pub fn port_of(&self, drive: usize) -> Option<usize> {
        self.ports.get(drive).map(AhciPort::nr)
    }

    /// Whether `drive` stopped on a device error
    pub fn is_faulted(&self, drive: usize) -> bool {
        self.ports.get(drive).is_some_and(AhciPort::is_faulted)
    }

    /// Command slots of `drive`
    pub fn slots(&self, drive: usize) -> Option<usize> {
        self.ports.get(drive).map(AhciPort::slots)
    }
}

/// Interrupt servicing loop
///
/// The only place completions are delivered and status bits cleared.
fn irq_loop(hba: Hba, ports: Arc<[AhciPort]>, line: IrqLine) {
    log::debug!("AHCI: interrupt thread running on GSI {}", line.gsi());
    loop {
        match line.wait() {
            IrqEvent::Interrupt => {
                let pending = hba.interrupt_status();
                for port in ports.iter().filter(|p| pending & (1 << p.nr()) != 0) {
                    port.handle_interrupt();
                }
                hba.clear_interrupts(pending);
                line.acknowledge();
            }
            IrqEvent::Kick => {
                for port in ports.iter() {
                    port.handle_interrupt();
                }
            }
            IrqEvent::Shutdown => break,
        }
    }
    log::debug!("AHCI: interrupt thread exiting");
}

impl Controller for AhciController {
    fn exists(&self, drive: usize) -> bool {
        drive < self.ports.len()
    }

    fn drive_count(&self) -> usize {
        self.ports.len()
    }

    fn get_params(&self, drive: usize) -> Result<DriveParams> {
        Ok(self.port(drive)?.params().clone())
    }

    fn flush(&self, drive: usize, producer: Arc<dyn Producer>, tag: Tag) -> Result<()> {
        self.port(drive)?.flush(producer, tag)
    }

    fn read(
        &self,
        drive: usize,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()> {
        self.port(drive)?
            .transfer(Direction::Read, producer, tag, transfer)
    }

    fn write(
        &self,
        drive: usize,
        producer: Arc<dyn Producer>,
        tag: Tag,
        transfer: Transfer,
    ) -> Result<()> {
        self.port(drive)?
            .transfer(Direction::Write, producer, tag, transfer)
    }
}

impl Drop for AhciController {
    fn drop(&mut self) {
        self.hba.write(regs::GHC, (self.hba.ghc() - Ghc::IE).bits());
        self.trigger.shutdown();
        if let Some(handle) = self.irq_thread.take() {
            if handle.join().is_err() {
                log::error!("AHCI: interrupt thread panicked");
            }
        }
        // Ports stop when `self.ports` drops its last reference after this
    }
}
