//! AHCI register layout
//!
//! The HBA exposes 0x100 bytes of generic host control followed by 32 port
//! register sets of 0x80 bytes each. Ports 0-29 fit into the first page of
//! the BAR; ports 30 and 31 spill over into the page after it, which is
//! mapped separately and only when one of those ports is implemented.

use std::sync::Arc;

use bitflags::bitflags;
use vrt_hw::RegisterIo;

use crate::{Result, StorageError};

// Generic host control
pub const CAP: usize = 0x00;
pub const GHC: usize = 0x04;
pub const IS: usize = 0x08;
pub const PI: usize = 0x0C;
pub const VS: usize = 0x10;
pub const CCC_CTL: usize = 0x14;
pub const CCC_PORTS: usize = 0x18;
pub const EM_LOC: usize = 0x1C;
pub const EM_CTL: usize = 0x20;
pub const CAP2: usize = 0x24;
pub const BOHC: usize = 0x28;

// Per-port registers, relative to the port base
pub const PX_CLB: usize = 0x00;
pub const PX_CLBU: usize = 0x04;
pub const PX_FB: usize = 0x08;
pub const PX_FBU: usize = 0x0C;
pub const PX_IS: usize = 0x10;
pub const PX_IE: usize = 0x14;
pub const PX_CMD: usize = 0x18;
pub const PX_TFD: usize = 0x20;
pub const PX_SIG: usize = 0x24;
pub const PX_SSTS: usize = 0x28;
pub const PX_SCTL: usize = 0x2C;
pub const PX_SERR: usize = 0x30;
pub const PX_SACT: usize = 0x34;
pub const PX_CI: usize = 0x38;
pub const PX_SNTF: usize = 0x3C;
pub const PX_FBS: usize = 0x40;

pub const GENERIC_SIZE: usize = 0x100;
pub const PORT_SIZE: usize = 0x80;
pub const MAX_PORTS: usize = 32;

/// Size of the first BAR page holding ports 0-29
pub const LOW_REGION_SIZE: usize = 0x1000;
/// Size of the second BAR region holding ports 30 and 31
pub const HIGH_REGION_SIZE: usize = 0x100;

/// Ports whose registers live in the high region
pub const HIGH_PORTS: u32 = (1 << 30) | (1 << 31);

/// Task file status bits
pub const TFD_ERR: u32 = 1 << 0;
pub const TFD_DRQ: u32 = 1 << 3;
pub const TFD_BSY: u32 = 1 << 7;

/// SStatus device detection: device present and PHY communication up
pub const SSTS_DET_MASK: u32 = 0xF;
pub const SSTS_DET_PRESENT: u32 = 3;

/// SControl device detection initialization: 1 holds the link in COMRESET
pub const SCTL_DET_MASK: u32 = 0xF;
pub const SCTL_DET_COMRESET: u32 = 1;
/// SControl power management: partial and slumber transitions disabled
pub const SCTL_IPM_MASK: u32 = 0xF << 8;
pub const SCTL_IPM_DISABLED: u32 = 3 << 8;

/// FIS-based switching enable
pub const FBS_EN: u32 = 1 << 0;

/// Command completion coalescing enable
pub const CCC_EN: u32 = 1 << 0;

/// Signature of a plain ATA drive
pub const SIG_ATA: u32 = 0x0000_0101;

const CAP_S64A: u32 = 1 << 31;
const CAP_EMS: u32 = 1 << 6;
const CAP_CCCS: u32 = 1 << 7;
const BOHC_BOS: u32 = 1 << 0;
const BOHC_OOS: u32 = 1 << 1;

bitflags! {
    /// Global host control
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ghc: u32 {
        const HR = 1 << 0;
        const IE = 1 << 1;
        const AE = 1 << 31;
    }
}

bitflags! {
    /// Port interrupt status and enable bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortIrq: u32 {
        /// Device to host register FIS
        const DHRS = 1 << 0;
        const PSS = 1 << 1;
        const DSS = 1 << 2;
        const SDBS = 1 << 3;
        const UFS = 1 << 4;
        const DPS = 1 << 5;
        const PCS = 1 << 6;
        const DMPS = 1 << 7;
        const PRCS = 1 << 22;
        const IPMS = 1 << 23;
        const OFS = 1 << 24;
        const INFS = 1 << 26;
        /// Interface fatal error
        const IFS = 1 << 27;
        /// Host bus data error
        const HBDS = 1 << 28;
        /// Host bus fatal error
        const HBFS = 1 << 29;
        /// Task file error
        const TFES = 1 << 30;
        const CPDS = 1 << 31;

        const ERROR = Self::IFS.bits() | Self::HBDS.bits() | Self::HBFS.bits() | Self::TFES.bits();
        const ENABLED = Self::DHRS.bits() | Self::PSS.bits() | Self::SDBS.bits() | Self::DPS.bits() | Self::ERROR.bits();
    }
}

bitflags! {
    /// Port command and status
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCmd: u32 {
        /// Start processing the command list
        const ST = 1 << 0;
        const SUD = 1 << 1;
        const POD = 1 << 2;
        /// FIS receive enable
        const FRE = 1 << 4;
        /// FIS receive running
        const FR = 1 << 14;
        /// Command list running
        const CR = 1 << 15;
    }
}

/// Decoded host capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Command slots per port
    pub slots: usize,
    /// 64-bit addressing supported
    pub addr64: bool,
    /// Command completion coalescing supported
    pub coalescing: bool,
    /// Enclosure management supported
    pub enclosure: bool,
}

impl Capabilities {
    pub fn decode(cap: u32) -> Self {
        Self {
            slots: ((cap >> 8) & 0x1F) as usize + 1,
            addr64: cap & CAP_S64A != 0,
            coalescing: cap & CAP_CCCS != 0,
            enclosure: cap & CAP_EMS != 0,
        }
    }
}

/// Base of port `nr` within the BAR
pub const fn port_offset(nr: usize) -> usize {
    GENERIC_SIZE + nr * PORT_SIZE
}

/// Register window of the host bus adapter
#[derive(Clone)]
pub struct Hba {
    low: Arc<dyn RegisterIo>,
    high: Option<Arc<dyn RegisterIo>>,
}

impl Hba {
    pub fn new(low: Arc<dyn RegisterIo>, high: Option<Arc<dyn RegisterIo>>) -> Self {
        Self { low, high }
    }

    pub fn read(&self, offset: usize) -> u32 {
        self.low.read32(offset)
    }

    pub fn write(&self, offset: usize, value: u32) {
        self.low.write32(offset, value)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::decode(self.read(CAP))
    }

    pub fn ghc(&self) -> Ghc {
        Ghc::from_bits_retain(self.read(GHC))
    }

    pub fn set_ghc(&self, flags: Ghc) {
        self.write(GHC, self.ghc().union(flags).bits());
    }

    /// Bitmap of implemented ports
    pub fn implemented(&self) -> u32 {
        self.read(PI)
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read(IS)
    }

    /// Acknowledge port interrupt bits in the global status
    pub fn clear_interrupts(&self, bits: u32) {
        self.write(IS, bits)
    }

    /// Turn off command completion coalescing
    ///
    /// Completions are expected per command, so a coalescing setup left by
    /// firmware is disabled. Returns whether it was enabled.
    pub fn disable_coalescing(&self) -> bool {
        let ctl = self.read(CCC_CTL);
        if ctl & CCC_EN == 0 {
            return false;
        }
        self.write(CCC_CTL, ctl & !CCC_EN);
        self.write(CCC_PORTS, 0);
        true
    }

    /// Enclosure management message buffer as (offset, size) in bytes
    pub fn enclosure_buffer(&self) -> (usize, usize) {
        let loc = self.read(EM_LOC);
        (((loc >> 16) as usize) * 4, ((loc & 0xFFFF) as usize) * 4)
    }

    pub fn enclosure_control(&self) -> u32 {
        self.read(EM_CTL)
    }

    /// Take the controller over from firmware if it supports handoff
    ///
    /// Returns whether firmware still claimed ownership afterwards.
    pub fn bios_handoff(&self, spins: usize) -> bool {
        if self.read(CAP2) & 1 == 0 {
            return false;
        }
        self.write(BOHC, self.read(BOHC) | BOHC_OOS);
        for _ in 0..spins {
            if self.read(BOHC) & BOHC_BOS == 0 {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }

    /// Registers of port `nr`
    pub fn port(&self, nr: usize) -> Result<PortRegs> {
        if nr >= MAX_PORTS {
            return Err(StorageError::Config(format!("port {} out of range", nr)));
        }
        let offset = port_offset(nr);
        if offset + PORT_SIZE <= self.low.size() {
            return Ok(PortRegs {
                io: Arc::clone(&self.low),
                base: offset,
            });
        }
        let high = self.high.as_ref().ok_or_else(|| {
            StorageError::Config(format!("port {} needs the second register region", nr))
        })?;
        let base = offset - LOW_REGION_SIZE;
        if base + PORT_SIZE > high.size() {
            return Err(StorageError::Config(format!(
                "port {} outside second register region",
                nr
            )));
        }
        Ok(PortRegs {
            io: Arc::clone(high),
            base,
        })
    }
}

/// Register set of one port
#[derive(Clone)]
pub struct PortRegs {
    io: Arc<dyn RegisterIo>,
    base: usize,
}

impl PortRegs {
    pub fn read(&self, reg: usize) -> u32 {
        self.io.read32(self.base + reg)
    }

    pub fn write(&self, reg: usize, value: u32) {
        self.io.write32(self.base + reg, value)
    }

    pub fn cmd(&self) -> PortCmd {
        PortCmd::from_bits_retain(self.read(PX_CMD))
    }

    pub fn set_cmd(&self, cmd: PortCmd) {
        self.write(PX_CMD, cmd.bits())
    }

    pub fn interrupt_status(&self) -> PortIrq {
        PortIrq::from_bits_retain(self.read(PX_IS))
    }

    /// Acknowledge status bits (write-1-to-clear)
    pub fn clear_interrupts(&self, bits: PortIrq) {
        self.write(PX_IS, bits.bits())
    }

    pub fn enable_interrupts(&self, bits: PortIrq) {
        self.write(PX_IE, bits.bits())
    }

    pub fn task_file(&self) -> u32 {
        self.read(PX_TFD)
    }

    /// Slots the HBA still processes
    pub fn commands_issued(&self) -> u32 {
        self.read(PX_CI)
    }

    pub fn active(&self) -> u32 {
        self.read(PX_SACT)
    }

    /// Hand the slots in `mask` to the HBA; bits not set are left alone
    pub fn issue(&self, mask: u32) {
        self.write(PX_CI, mask)
    }

    pub fn device_detected(&self) -> bool {
        self.read(PX_SSTS) & SSTS_DET_MASK == SSTS_DET_PRESENT
    }

    pub fn sata_control(&self) -> u32 {
        self.read(PX_SCTL)
    }

    /// Hold the link in COMRESET (`true`) or release it
    pub fn set_comreset(&self, reset: bool) {
        let det = if reset { SCTL_DET_COMRESET } else { 0 };
        let sctl = (self.sata_control() & !(SCTL_DET_MASK | SCTL_IPM_MASK)) | SCTL_IPM_DISABLED | det;
        self.write(PX_SCTL, sctl)
    }

    /// Acknowledge set device bits notifications (write-1-to-clear)
    pub fn clear_notifications(&self) {
        self.write(PX_SNTF, u32::MAX)
    }

    pub fn fis_switching(&self) -> u32 {
        self.read(PX_FBS)
    }

    /// Turn off FIS-based switching; only valid while the port is stopped
    pub fn disable_fis_switching(&self) {
        let fbs = self.fis_switching();
        if fbs & FBS_EN != 0 {
            self.write(PX_FBS, fbs & !FBS_EN);
        }
    }

    pub fn signature(&self) -> u32 {
        self.read(PX_SIG)
    }

    /// Clear all SATA error bits
    pub fn clear_errors(&self) {
        self.write(PX_SERR, u32::MAX)
    }

    pub fn set_command_list(&self, paddr: u64) {
        self.write(PX_CLB, paddr as u32);
        self.write(PX_CLBU, (paddr >> 32) as u32);
    }

    pub fn set_fis_base(&self, paddr: u64) {
        self.write(PX_FB, paddr as u32);
        self.write(PX_FBU, (paddr >> 32) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Regs(Vec<AtomicU32>);

    impl Regs {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(Self((0..size / 4).map(|_| AtomicU32::new(0)).collect()))
        }
    }

    impl RegisterIo for Regs {
        fn size(&self) -> usize {
            self.0.len() * 4
        }
        fn read32(&self, offset: usize) -> u32 {
            self.0[offset / 4].load(Ordering::SeqCst)
        }
        fn write32(&self, offset: usize, value: u32) {
            self.0[offset / 4].store(value, Ordering::SeqCst)
        }
    }

    #[test]
    fn test_capabilities_decode() {
        let caps = Capabilities::decode((1 << 31) | (31 << 8) | 5);
        assert_eq!(caps.slots, 32);
        assert!(caps.addr64);

        let caps = Capabilities::decode(3 << 8);
        assert_eq!(caps.slots, 4);
        assert!(!caps.addr64);
    }

    #[test]
    fn test_port_placement() {
        assert_eq!(port_offset(0), 0x100);
        assert_eq!(port_offset(29), 0xF80);
        assert_eq!(port_offset(30), 0x1000);
        assert_eq!(port_offset(31), 0x1080);
    }

    #[test]
    fn test_high_ports_need_second_region() {
        let low = Regs::new(LOW_REGION_SIZE);
        let hba = Hba::new(low.clone(), None);
        assert!(hba.port(29).is_ok());
        assert!(matches!(hba.port(30), Err(StorageError::Config(_))));
        assert!(matches!(hba.port(32), Err(StorageError::Config(_))));

        let high = Regs::new(HIGH_REGION_SIZE);
        let hba = Hba::new(low, Some(high.clone()));
        hba.port(31).unwrap().write(PX_CI, 0x5);
        assert_eq!(high.read32(0x80 + PX_CI), 0x5);
        hba.port(30).unwrap().write(PX_IE, 0x7);
        assert_eq!(high.read32(PX_IE), 0x7);
    }

    #[test]
    fn test_register_offsets() {
        assert_eq!((CCC_CTL, CCC_PORTS, EM_LOC, EM_CTL), (0x14, 0x18, 0x1C, 0x20));
        assert_eq!((CAP2, BOHC), (0x24, 0x28));
        assert_eq!((PX_SCTL, PX_SNTF, PX_FBS), (0x2C, 0x3C, 0x40));
        assert!(PX_FBS + 4 <= PORT_SIZE);
    }

    #[test]
    fn test_comreset_sets_det_and_ipm() {
        let low = Regs::new(LOW_REGION_SIZE);
        let port = Hba::new(low.clone(), None).port(1).unwrap();
        low.write32(port_offset(1) + PX_SCTL, 0x0000_0120);

        port.set_comreset(true);
        assert_eq!(port.sata_control(), 0x0000_0321);
        port.set_comreset(false);
        assert_eq!(port.sata_control(), 0x0000_0320);
    }

    #[test]
    fn test_fis_switching_and_notifications() {
        let low = Regs::new(LOW_REGION_SIZE);
        let port = Hba::new(low.clone(), None).port(2).unwrap();
        low.write32(port_offset(2) + PX_FBS, 0x0000_0f01);
        port.disable_fis_switching();
        assert_eq!(port.fis_switching(), 0x0000_0f00);

        port.clear_notifications();
        assert_eq!(low.read32(port_offset(2) + PX_SNTF), u32::MAX);
    }

    #[test]
    fn test_coalescing_and_enclosure() {
        let low = Regs::new(LOW_REGION_SIZE);
        let hba = Hba::new(low.clone(), None);
        assert!(!hba.disable_coalescing());

        low.write32(CCC_CTL, 0x0010_0101);
        low.write32(CCC_PORTS, 0x3);
        assert!(hba.disable_coalescing());
        assert_eq!(low.read32(CCC_CTL), 0x0010_0100);
        assert_eq!(low.read32(CCC_PORTS), 0);

        low.write32(EM_LOC, 0x0040_0010);
        low.write32(EM_CTL, 0x0001_0000);
        assert_eq!(hba.enclosure_buffer(), (0x100, 0x40));
        assert_eq!(hba.enclosure_control(), 0x0001_0000);

        let caps = Capabilities::decode(CAP_CCCS | CAP_EMS);
        assert!(caps.coalescing && caps.enclosure);
    }

    #[test]
    fn test_port_irq_error_mask() {
        let status = PortIrq::DHRS | PortIrq::TFES;
        assert!(status.intersects(PortIrq::ERROR));
        assert!(!(PortIrq::DHRS | PortIrq::SDBS).intersects(PortIrq::ERROR));
        assert!(PortIrq::ENABLED.contains(PortIrq::ERROR));
    }
}
