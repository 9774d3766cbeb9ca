//! Command structures shared with the HBA
//!
//! Command list, command tables and FIS receive area live in DMA memory and
//! are read by the controller. The layouts below are fixed by the AHCI and
//! SATA specifications.

use static_assertions::assert_eq_size;

use crate::{DriveFlags, DriveParams, Sector};

/// Entries in the command list (one per slot, 32 slots at most)
pub const CMD_HEADER_SIZE: usize = 32;
pub const CMD_LIST_SIZE: usize = 32 * CMD_HEADER_SIZE;
pub const CMD_LIST_ALIGN: usize = 1024;

/// Received FIS area
pub const FIS_AREA_SIZE: usize = 256;
pub const FIS_AREA_ALIGN: usize = 256;

/// Command table: command FIS region followed by the PRDT
pub const PRDT_OFFSET: usize = 0x80;
pub const PRDT_ENTRIES: usize = 8;
pub const PRDT_ENTRY_SIZE: usize = 16;
pub const CMD_TABLE_SIZE: usize = PRDT_OFFSET + PRDT_ENTRIES * PRDT_ENTRY_SIZE;
pub const CMD_TABLE_ALIGN: usize = 128;

/// Largest byte count a single PRDT entry can describe
pub const PRD_MAX_BYTES: usize = 4 << 20;

/// Sector count limits of one command
pub const MAX_SECTORS_LBA48: Sector = 0x1_0000;
pub const MAX_SECTORS_LBA28: Sector = 0x100;

// ATA commands
pub const ATA_READ_DMA_EXT: u8 = 0x25;
pub const ATA_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_READ_DMA: u8 = 0xC8;
pub const ATA_WRITE_DMA: u8 = 0xCA;
pub const ATA_FLUSH_CACHE: u8 = 0xE7;
pub const ATA_FLUSH_CACHE_EXT: u8 = 0xEA;
pub const ATA_IDENTIFY: u8 = 0xEC;

/// Size of the IDENTIFY DEVICE response
pub const IDENTIFY_SIZE: usize = 512;

const FIS_TYPE_REG_H2D: u8 = 0x27;
const FIS_H2D_COMMAND: u8 = 1 << 7;
const DEVICE_LBA: u8 = 1 << 6;

const HEADER_WRITE: u16 = 1 << 6;
const HEADER_CLEAR_BUSY: u16 = 1 << 10;
const PRD_INTERRUPT: u32 = 1 << 31;

/// Command list entry
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdHeader {
    /// FIS length in dwords and direction/control bits
    pub flags: u16,
    /// Number of PRDT entries
    pub prdtl: u16,
    /// Bytes transferred, written by the HBA
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    pub reserved: [u32; 4],
}

/// Physical region descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    pub reserved: u32,
    /// Byte count minus one, interrupt on completion in bit 31
    pub dbc: u32,
}

/// Register host-to-device FIS
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FisRegH2D {
    pub fis_type: u8,
    pub flags: u8,
    pub command: u8,
    pub feature_low: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub feature_high: u8,
    pub count_low: u8,
    pub count_high: u8,
    pub icc: u8,
    pub control: u8,
    pub reserved: [u8; 4],
}

assert_eq_size!(CmdHeader, [u8; CMD_HEADER_SIZE]);
assert_eq_size!(PrdtEntry, [u8; PRDT_ENTRY_SIZE]);
assert_eq_size!(FisRegH2D, [u8; 20]);

impl CmdHeader {
    /// Header for a command table at `ctba` with `prdtl` descriptors
    pub fn new(ctba: u64, prdtl: usize, write: bool) -> Self {
        let cfl = (core::mem::size_of::<FisRegH2D>() / 4) as u16;
        let mut flags = cfl | HEADER_CLEAR_BUSY;
        if write {
            flags |= HEADER_WRITE;
        }
        Self {
            flags,
            prdtl: prdtl as u16,
            prdbc: 0,
            ctba: ctba as u32,
            ctbau: (ctba >> 32) as u32,
            reserved: [0; 4],
        }
    }

    pub fn is_write(&self) -> bool {
        self.flags & HEADER_WRITE != 0
    }

    pub fn table_address(&self) -> u64 {
        (self.ctbau as u64) << 32 | self.ctba as u64
    }
}

impl PrdtEntry {
    /// Descriptor for `len` bytes at `paddr` (1..=4 MiB)
    pub fn new(paddr: u64, len: usize, interrupt: bool) -> Self {
        debug_assert!(len > 0 && len <= PRD_MAX_BYTES);
        let mut dbc = (len as u32 - 1) & 0x3F_FFFF;
        if interrupt {
            dbc |= PRD_INTERRUPT;
        }
        Self {
            dba: paddr as u32,
            dbau: (paddr >> 32) as u32,
            reserved: 0,
            dbc,
        }
    }

    pub fn address(&self) -> u64 {
        (self.dbau as u64) << 32 | self.dba as u64
    }

    pub fn byte_count(&self) -> usize {
        (self.dbc & 0x3F_FFFF) as usize + 1
    }
}

/// Split a contiguous buffer into PRDT entries
///
/// Returns `None` if more than [`PRDT_ENTRIES`] entries are needed.
pub fn build_prdt(paddr: u64, len: usize) -> Option<Vec<PrdtEntry>> {
    let entries = len.div_ceil(PRD_MAX_BYTES);
    if entries == 0 || entries > PRDT_ENTRIES {
        return None;
    }
    let mut prdt = Vec::with_capacity(entries);
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(PRD_MAX_BYTES);
        let last = done + chunk == len;
        prdt.push(PrdtEntry::new(paddr + done as u64, chunk, last));
        done += chunk;
    }
    Some(prdt)
}

impl FisRegH2D {
    /// Command FIS without address or count
    pub fn command(command: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            flags: FIS_H2D_COMMAND,
            command,
            ..Self::default()
        }
    }

    /// Command FIS addressing `count` sectors at `lba`
    ///
    /// 28-bit commands carry address bits 24-27 in the low nibble of the
    /// device register and at most 0x100 sectors; 48-bit commands use the
    /// extended address bytes. A full-size count is encoded as zero.
    pub fn lba(command: u8, lba: Sector, count: Sector) -> Self {
        let base = Self {
            lba0: lba as u8,
            lba1: (lba >> 8) as u8,
            lba2: (lba >> 16) as u8,
            count_low: count as u8,
            ..Self::command(command)
        };
        if is_lba28(command) {
            debug_assert!(lba >> 28 == 0 && count <= MAX_SECTORS_LBA28);
            return Self {
                device: DEVICE_LBA | ((lba >> 24) & 0x0F) as u8,
                ..base
            };
        }
        Self {
            device: DEVICE_LBA,
            lba3: (lba >> 24) as u8,
            lba4: (lba >> 32) as u8,
            lba5: (lba >> 40) as u8,
            count_high: (count >> 8) as u8,
            ..base
        }
    }

    pub fn lba_value(&self) -> Sector {
        let low = self.lba0 as u64 | (self.lba1 as u64) << 8 | (self.lba2 as u64) << 16;
        if is_lba28(self.command) {
            return low | ((self.device & 0x0F) as u64) << 24;
        }
        low | (self.lba3 as u64) << 24 | (self.lba4 as u64) << 32 | (self.lba5 as u64) << 40
    }

    /// Sector count, with zero meaning the command's maximum
    pub fn count_value(&self) -> Sector {
        if is_lba28(self.command) {
            return match self.count_low {
                0 => MAX_SECTORS_LBA28,
                n => n as u64,
            };
        }
        match (self.count_high as u64) << 8 | self.count_low as u64 {
            0 => MAX_SECTORS_LBA48,
            n => n,
        }
    }
}

/// Whether `command` takes a 28-bit address
pub fn is_lba28(command: u8) -> bool {
    matches!(command, ATA_READ_DMA | ATA_WRITE_DMA)
}

/// Block command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// ATA opcode for a transfer in `direction`
pub fn transfer_opcode(direction: Direction, flags: DriveFlags) -> u8 {
    let lba48 = flags.contains(DriveFlags::LBA48);
    match (direction, lba48) {
        (Direction::Read, true) => ATA_READ_DMA_EXT,
        (Direction::Read, false) => ATA_READ_DMA,
        (Direction::Write, true) => ATA_WRITE_DMA_EXT,
        (Direction::Write, false) => ATA_WRITE_DMA,
    }
}

/// ATA opcode for a cache flush
pub fn flush_opcode(flags: DriveFlags) -> u8 {
    if flags.contains(DriveFlags::LBA48) {
        ATA_FLUSH_CACHE_EXT
    } else {
        ATA_FLUSH_CACHE
    }
}

/// Decode an IDENTIFY DEVICE response
pub fn parse_identify(data: &[u8; IDENTIFY_SIZE]) -> DriveParams {
    let word = |i: usize| u16::from_le_bytes([data[2 * i], data[2 * i + 1]]);

    let mut flags = DriveFlags::PRESENT | DriveFlags::DMA;
    let w83 = word(83);
    // Bits 15:14 of word 83 must read 01 for the word to be valid
    let w83_valid = w83 & 0xC000 == 0x4000;
    if w83_valid && w83 & (1 << 10) != 0 {
        flags |= DriveFlags::LBA48;
    }
    if w83_valid && w83 & ((1 << 12) | (1 << 13)) != 0 {
        flags |= DriveFlags::FLUSH;
    }

    let sectors = if flags.contains(DriveFlags::LBA48) {
        (0..4).fold(0u64, |acc, i| acc | (word(100 + i) as u64) << (16 * i))
    } else {
        word(60) as u64 | (word(61) as u64) << 16
    };

    let w106 = word(106);
    let mut sector_size = 512;
    if w106 & 0xC000 == 0x4000 && w106 & (1 << 12) != 0 {
        let words = word(117) as usize | (word(118) as usize) << 16;
        if words >= 256 {
            sector_size = words * 2;
        }
    }

    let limit = if flags.contains(DriveFlags::LBA48) {
        MAX_SECTORS_LBA48
    } else {
        MAX_SECTORS_LBA28
    };
    let prdt_limit = (PRDT_ENTRIES * PRD_MAX_BYTES / sector_size) as Sector;

    // Model number, two characters per word with the first in the high byte
    let mut model = Vec::with_capacity(40);
    for i in 27..47 {
        let [lo, hi] = word(i).to_le_bytes();
        model.push(hi);
        model.push(lo);
    }
    let name = String::from_utf8_lossy(&model).trim().to_string();

    DriveParams {
        flags,
        sectors,
        sector_size,
        max_sectors: limit.min(prdt_limit),
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify(words: &[(usize, u16)], model: &str) -> [u8; IDENTIFY_SIZE] {
        let mut data = [0u8; IDENTIFY_SIZE];
        for &(i, w) in words {
            data[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
        }
        let mut text = [b' '; 40];
        text[..model.len()].copy_from_slice(model.as_bytes());
        for (i, pair) in text.chunks(2).enumerate() {
            data[54 + 2 * i] = pair[1];
            data[54 + 2 * i + 1] = pair[0];
        }
        data
    }

    #[test]
    fn test_identify_lba48() {
        let data = identify(
            &[(83, 0x4000 | 1 << 10 | 1 << 13), (100, 0x0000), (101, 0x0010)],
            "VIREO DISK",
        );
        let params = parse_identify(&data);
        assert!(params.flags.contains(DriveFlags::LBA48 | DriveFlags::FLUSH));
        assert_eq!(params.sectors, 0x10_0000);
        assert_eq!(params.sector_size, 512);
        assert_eq!(params.max_sectors, MAX_SECTORS_LBA48);
        assert_eq!(params.name, "VIREO DISK");
    }

    #[test]
    fn test_identify_lba28_and_large_sectors() {
        let data = identify(
            &[(60, 0x5678), (61, 0x0001), (106, 0x4000 | 1 << 12), (117, 2048), (118, 0)],
            "OLD",
        );
        let params = parse_identify(&data);
        assert!(!params.flags.contains(DriveFlags::LBA48));
        assert!(!params.flags.contains(DriveFlags::FLUSH));
        assert_eq!(params.sectors, 0x1_5678);
        assert_eq!(params.sector_size, 4096);
        assert_eq!(params.max_sectors, MAX_SECTORS_LBA28);
    }

    #[test]
    fn test_fis_lba_encoding() {
        let fis = FisRegH2D::lba(ATA_READ_DMA_EXT, 0x0102_0304_0506, 0x10000);
        assert_eq!(fis.fis_type, 0x27);
        assert_eq!(fis.flags, 0x80);
        assert_eq!(fis.lba0, 0x06);
        assert_eq!(fis.lba5, 0x01);
        assert_eq!(fis.device, 0x40);
        assert_eq!((fis.count_low, fis.count_high), (0, 0));
        assert_eq!(fis.lba_value(), 0x0102_0304_0506);
        assert_eq!(fis.count_value(), 0x10000);
    }

    #[test]
    fn test_fis_lba28_uses_device_nibble() {
        let fis = FisRegH2D::lba(ATA_READ_DMA, 0x0ABC_DEF0, 1);
        assert_eq!((fis.lba0, fis.lba1, fis.lba2), (0xF0, 0xDE, 0xBC));
        assert_eq!(fis.device, 0x40 | 0x0A);
        assert_eq!((fis.lba3, fis.lba4, fis.lba5), (0, 0, 0));
        assert_eq!(fis.lba_value(), 0x0ABC_DEF0);

        let fis = FisRegH2D::lba(ATA_WRITE_DMA, 0x0FFF_FFFF, MAX_SECTORS_LBA28);
        assert_eq!(fis.device & 0x0F, 0x0F);
        assert_eq!((fis.count_low, fis.count_high), (0, 0));
        assert_eq!(fis.count_value(), MAX_SECTORS_LBA28);

        // The same address on a 48-bit command leaves the device nibble clear
        let fis = FisRegH2D::lba(ATA_READ_DMA_EXT, 0x0ABC_DEF0, 1);
        assert_eq!(fis.device, 0x40);
        assert_eq!(fis.lba3, 0x0A);
    }

    #[test]
    fn test_prdt_split() {
        let prdt = build_prdt(0x10_0000, 9 << 20).unwrap();
        assert_eq!(prdt.len(), 3);
        assert_eq!(prdt[0].byte_count(), PRD_MAX_BYTES);
        assert_eq!(prdt[2].byte_count(), 1 << 20);
        assert_eq!(prdt[1].address(), 0x10_0000 + (4 << 20));
        assert_eq!(prdt[2].dbc & PRD_INTERRUPT, PRD_INTERRUPT);
        assert_eq!(prdt[0].dbc & PRD_INTERRUPT, 0);

        assert!(build_prdt(0, PRDT_ENTRIES * PRD_MAX_BYTES).is_some());
        assert!(build_prdt(0, PRDT_ENTRIES * PRD_MAX_BYTES + 1).is_none());
        assert!(build_prdt(0, 0).is_none());
    }

    #[test]
    fn test_header_flags() {
        let header = CmdHeader::new(0x1_2345_6780, 2, true);
        assert_eq!(header.flags & 0x1F, 5);
        assert!(header.is_write());
        assert_eq!(header.table_address(), 0x1_2345_6780);
        assert!(!CmdHeader::new(0, 1, false).is_write());
    }
}
