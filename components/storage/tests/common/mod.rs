//! Simulated AHCI host bus adapter
//!
//! Implements enough of the register protocol for the driver to run against
//! it: write-1-to-clear status registers, write-1-to-set PxCI, engine
//! start/stop handshakes, link reset through SControl, and command execution
//! by walking the command list and PRDT in (identity-mapped) DMA memory.
//! Commands execute when issued; their completion is either signalled
//! immediately or held back until the test releases it. Drive contents are
//! stored sparsely, so drives may be larger than host memory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use vrt_hw::{DmaRegion, HwError, IrqLine, IrqTrigger, RegisterIo, ResourceBroker};
use vrt_storage::ahci::regs::*;

pub const BAR: usize = 0xfebf_0000;
pub const GSI: u32 = 11;
pub const SECTOR: usize = 512;

const DHRS: u32 = 1 << 0;
const TFES: u32 = 1 << 30;
const CAP_CCCS: u32 = 1 << 7;
/// SError DIAG.X, set when the link comes back after COMRESET
const SERR_DIAG_X: u32 = 1 << 26;
/// SStatus of a link held in reset: device present, no communication
const SSTS_NO_PHY: u32 = 1;

#[derive(Default)]
struct SimPort {
    present: bool,
    clb: u64,
    fb: u64,
    is: u32,
    ie: u32,
    cmd: u32,
    tfd: u32,
    sig: u32,
    ssts: u32,
    sctl: u32,
    serr: u32,
    sact: u32,
    ci: u32,
    sntf: u32,
    fbs: u32,
    /// Executed but not yet signalled complete
    held: u32,
    sectors: usize,
    lba48: bool,
    /// Written sectors; everything else reads as zero
    disk: HashMap<usize, Vec<u8>>,
    manual: bool,
    fail_next: bool,
    /// The link stays down after a COMRESET
    link_fails: bool,
    resets: usize,
    executed: Vec<u8>,
}

impl SimPort {
    fn read_sectors(&self, start: usize, count: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(count * SECTOR);
        for sector in start..start + count {
            match self.disk.get(&sector) {
                Some(bytes) => data.extend_from_slice(bytes),
                None => data.resize(data.len() + SECTOR, 0),
            }
        }
        data
    }

    fn write_sectors(&mut self, start: usize, data: &[u8]) {
        for (i, chunk) in data.chunks(SECTOR).enumerate() {
            let mut bytes = vec![0; SECTOR];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.disk.insert(start + i, bytes);
        }
    }
}

struct State {
    cap: u32,
    ghc: u32,
    is: u32,
    pi: u32,
    ccc_ctl: u32,
    ccc_ports: u32,
    ports: Vec<SimPort>,
    irq: Option<IrqTrigger>,
    interrupts: u64,
}

/// Simulated controller shared by its register windows
pub struct SimHba {
    state: Mutex<State>,
}

impl SimHba {
    /// Controller with `slots` command slots per port and no ports yet
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                cap: (1 << 31) | (((slots - 1) as u32) << 8) | 31,
                ghc: 0,
                is: 0,
                pi: 0,
                ccc_ctl: 0,
                ccc_ports: 0,
                ports: (0..MAX_PORTS).map(|_| SimPort::default()).collect(),
                irq: None,
                interrupts: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Implement port `nr` with a 48-bit drive of `sectors` sectors
    pub fn attach_disk(&self, nr: usize, sectors: usize) {
        self.attach(nr, sectors, true);
    }

    /// Implement port `nr` with a drive limited to 28-bit addressing
    pub fn attach_lba28_disk(&self, nr: usize, sectors: usize) {
        assert!(sectors <= 0x0fff_ffff);
        self.attach(nr, sectors, false);
    }

    fn attach(&self, nr: usize, sectors: usize, lba48: bool) {
        let mut state = self.lock();
        state.pi |= 1 << nr;
        let port = &mut state.ports[nr];
        port.present = true;
        port.ssts = SSTS_DET_PRESENT | 0x100;
        port.sig = SIG_ATA;
        port.sectors = sectors;
        port.lba48 = lba48;
    }

    /// Keep the link of port `nr` down once it has been reset
    pub fn fail_link(&self, nr: usize) {
        self.lock().ports[nr].link_fails = true;
    }

    /// Leave firmware settings behind: coalescing on, FIS switching on
    /// port `nr`, a pending notification and SATA errors
    pub fn dirty_firmware_state(&self, nr: usize) {
        let mut state = self.lock();
        state.cap |= CAP_CCCS;
        state.ccc_ctl = 0x0010_0101;
        state.ccc_ports = 1 << nr;
        let port = &mut state.ports[nr];
        port.fbs = 0x0000_0001;
        port.sntf = 0x1;
        port.serr = 0x0001_0000;
    }

    pub fn coalescing(&self) -> (u32, u32) {
        let state = self.lock();
        (state.ccc_ctl, state.ccc_ports)
    }

    /// (SControl, SError, SNotification, FBS) of port `nr`
    pub fn link_state(&self, nr: usize) -> (u32, u32, u32, u32) {
        let state = self.lock();
        let port = &state.ports[nr];
        (port.sctl, port.serr, port.sntf, port.fbs)
    }

    /// COMRESETs seen on port `nr`
    pub fn resets(&self, nr: usize) -> usize {
        self.lock().ports[nr].resets
    }

    pub fn port_ie(&self, nr: usize) -> u32 {
        self.lock().ports[nr].ie
    }

    /// Implement port `nr` with nothing attached
    pub fn attach_empty(&self, nr: usize) {
        let mut state = self.lock();
        state.pi |= 1 << nr;
        state.ports[nr].sig = 0xffff_ffff;
    }

    /// Hold completions of port `nr` until released by the test
    pub fn set_manual(&self, nr: usize, manual: bool) {
        self.lock().ports[nr].manual = manual;
    }

    /// Make the next command on port `nr` fail with a task file error
    pub fn fail_next(&self, nr: usize) {
        self.lock().ports[nr].fail_next = true;
    }

    /// Slots executed on port `nr` whose completion is held back
    pub fn held(&self, nr: usize) -> u32 {
        self.lock().ports[nr].held
    }

    pub fn commands_issued(&self, nr: usize) -> u32 {
        self.lock().ports[nr].ci
    }

    /// ATA opcodes executed on port `nr`, in order
    pub fn executed(&self, nr: usize) -> Vec<u8> {
        self.lock().ports[nr].executed.clone()
    }

    pub fn interrupts(&self) -> u64 {
        self.lock().interrupts
    }

    pub fn ghc(&self) -> u32 {
        self.lock().ghc
    }

    pub fn port_cmd(&self, nr: usize) -> u32 {
        self.lock().ports[nr].cmd
    }

    /// Signal completion of held slots in `mask`
    pub fn complete(&self, nr: usize, mask: u32) {
        let mut state = self.lock();
        let port = &mut state.ports[nr];
        let done = port.held & mask;
        port.held &= !done;
        port.ci &= !done;
        port.is |= DHRS;
        raise(&mut state, nr);
    }

    pub fn complete_all(&self, nr: usize) {
        self.complete(nr, u32::MAX);
    }

    pub fn disk_read(&self, nr: usize, sector: usize, len: usize) -> Vec<u8> {
        let state = self.lock();
        let mut data = state.ports[nr].read_sectors(sector, len.div_ceil(SECTOR));
        data.truncate(len);
        data
    }

    pub fn disk_write(&self, nr: usize, sector: usize, data: &[u8]) {
        self.lock().ports[nr].write_sectors(sector, data);
    }

    fn read(&self, offset: usize) -> u32 {
        let state = self.lock();
        if offset < GENERIC_SIZE {
            return match offset {
                CAP => state.cap,
                GHC => state.ghc,
                IS => state.is,
                PI => state.pi,
                VS => 0x0001_0300,
                CCC_CTL => state.ccc_ctl,
                CCC_PORTS => state.ccc_ports,
                _ => 0,
            };
        }
        let nr = (offset - GENERIC_SIZE) / PORT_SIZE;
        let port = &state.ports[nr];
        match (offset - GENERIC_SIZE) % PORT_SIZE {
            PX_CLB => port.clb as u32,
            PX_CLBU => (port.clb >> 32) as u32,
            PX_FB => port.fb as u32,
            PX_FBU => (port.fb >> 32) as u32,
            PX_IS => port.is,
            PX_IE => port.ie,
            PX_CMD => port.cmd,
            PX_TFD => port.tfd,
            PX_SIG => port.sig,
            PX_SSTS => port.ssts,
            PX_SCTL => port.sctl,
            PX_SERR => port.serr,
            PX_SACT => port.sact,
            PX_CI => port.ci,
            PX_SNTF => port.sntf,
            PX_FBS => port.fbs,
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.lock();
        if offset < GENERIC_SIZE {
            match offset {
                GHC => state.ghc = value & !1,
                IS => state.is &= !value,
                CCC_CTL => state.ccc_ctl = value,
                CCC_PORTS => state.ccc_ports = value,
                _ => {}
            }
            return;
        }
        let nr = (offset - GENERIC_SIZE) / PORT_SIZE;
        let port = &mut state.ports[nr];
        match (offset - GENERIC_SIZE) % PORT_SIZE {
            PX_CLB => port.clb = (port.clb & !0xffff_ffff) | value as u64,
            PX_CLBU => port.clb = (port.clb & 0xffff_ffff) | (value as u64) << 32,
            PX_FB => port.fb = (port.fb & !0xffff_ffff) | value as u64,
            PX_FBU => port.fb = (port.fb & 0xffff_ffff) | (value as u64) << 32,
            PX_IS => port.is &= !value,
            PX_IE => port.ie = value,
            PX_CMD => {
                let mut cmd = value & 0x1f;
                if cmd & 1 != 0 {
                    cmd |= 1 << 15;
                }
                if cmd & (1 << 4) != 0 {
                    cmd |= 1 << 14;
                }
                port.cmd = cmd;
            }
            PX_SCTL => {
                port.sctl = value;
                if !port.present {
                    return;
                }
                if value & SCTL_DET_MASK == SCTL_DET_COMRESET {
                    port.resets += 1;
                    port.ssts = SSTS_NO_PHY;
                } else if port.ssts == SSTS_NO_PHY && !port.link_fails {
                    port.ssts = SSTS_DET_PRESENT | 0x100;
                    port.serr |= SERR_DIAG_X;
                }
            }
            PX_SERR => port.serr &= !value,
            PX_SNTF => port.sntf &= !value,
            PX_FBS => port.fbs = value & FBS_EN,
            PX_CI => {
                if port.cmd & 1 == 0 {
                    return;
                }
                let new = value & !port.ci;
                port.ci |= new;
                let mut remaining = new;
                while remaining != 0 {
                    let slot = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    execute(&mut state, nr, slot);
                }
            }
            _ => {}
        }
    }
}

fn execute(state: &mut State, nr: usize, slot: usize) {
    let port = &mut state.ports[nr];
    let header = port.clb as usize + slot * 32;
    // SAFETY: DMA memory is identity mapped host memory owned by the driver.
    let (flags, prdtl, ctba) = unsafe {
        (
            read_u32(header) & 0xffff,
            read_u32(header) >> 16,
            read_u32(header + 8) as u64 | (read_u32(header + 12) as u64) << 32,
        )
    };
    let table = ctba as usize;
    let fis = unsafe { read_bytes(table, 20) };
    let opcode = fis[2];
    let low = fis[4] as usize | (fis[5] as usize) << 8 | (fis[6] as usize) << 16;
    // READ DMA / WRITE DMA carry LBA 27:24 in the device register
    let lba28 = matches!(opcode, 0xC8 | 0xCA);
    let (lba, count) = if lba28 {
        let count = match fis[12] {
            0 => 0x100,
            n => n as usize,
        };
        (low | ((fis[7] & 0x0F) as usize) << 24, count)
    } else {
        let high = fis[8] as usize | (fis[9] as usize) << 8 | (fis[10] as usize) << 16;
        let count = match fis[12] as usize | (fis[13] as usize) << 8 {
            0 => 0x10000,
            n => n,
        };
        (low | high << 24, count)
    };
    port.executed.push(opcode);

    let extended = matches!(opcode, 0x25 | 0x35 | 0xEA);
    let transfer = matches!(opcode, 0x25 | 0x35 | 0xC8 | 0xCA);
    let in_range = !transfer || lba + count <= port.sectors;
    if port.fail_next || (extended && !port.lba48) || !in_range {
        port.fail_next = false;
        port.tfd = 0x51 | (0x04 << 8);
        port.is |= TFES;
        raise(state, nr);
        return;
    }

    let prdt: Vec<(usize, usize)> = (0..prdtl as usize)
        .map(|i| unsafe {
            let entry = table + 0x80 + i * 16;
            (
                read_u32(entry) as usize | (read_u32(entry + 4) as usize) << 32,
                (read_u32(entry + 12) & 0x3f_ffff) as usize + 1,
            )
        })
        .collect();

    let write = flags & (1 << 6) != 0;
    let mut moved = 0;
    match opcode {
        0xEC => {
            let identify = identify_data(port.sectors, port.lba48);
            moved = scatter(&prdt, &identify);
        }
        0x25 | 0xC8 if !write => {
            let data = port.read_sectors(lba, count);
            moved = scatter(&prdt, &data);
        }
        0x35 | 0xCA if write => {
            let data = gather(&prdt, count * SECTOR);
            port.write_sectors(lba, &data);
            moved = data.len();
        }
        0xEA | 0xE7 => {}
        _ => {
            port.tfd = 0x51 | (0x04 << 8);
            port.is |= TFES;
            raise(state, nr);
            return;
        }
    }
    unsafe { write_u32(header + 4, moved as u32) };

    port.tfd = 0x50;
    if port.manual {
        port.held |= 1 << slot;
    } else {
        port.ci &= !(1 << slot);
        port.is |= DHRS;
        raise(state, nr);
    }
}

fn raise(state: &mut State, nr: usize) {
    let port = &state.ports[nr];
    if port.is & port.ie == 0 {
        return;
    }
    state.is |= 1 << nr;
    if state.ghc & 0x2 != 0 {
        state.interrupts += 1;
        if let Some(irq) = &state.irq {
            irq.fire();
        }
    }
}

fn identify_data(sectors: usize, lba48: bool) -> Vec<u8> {
    let mut words = [0u16; 256];
    if lba48 {
        words[83] = 0x4000 | 1 << 10 | 1 << 13;
        for i in 0..4 {
            words[100 + i] = (sectors >> (16 * i)) as u16;
        }
    } else {
        words[83] = 0x4000 | 1 << 12;
    }
    words[60] = sectors.min(0x0fff_ffff) as u16;
    words[61] = (sectors.min(0x0fff_ffff) >> 16) as u16;
    let model = b"VIREO SIM DISK                          ";
    for i in 0..20 {
        words[27 + i] = (model[2 * i] as u16) << 8 | model[2 * i + 1] as u16;
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn scatter(prdt: &[(usize, usize)], data: &[u8]) -> usize {
    let mut done = 0;
    for &(addr, len) in prdt {
        let n = len.min(data.len() - done);
        unsafe { std::ptr::copy_nonoverlapping(data[done..].as_ptr(), addr as *mut u8, n) };
        done += n;
        if done == data.len() {
            break;
        }
    }
    done
}

fn gather(prdt: &[(usize, usize)], total: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(total);
    for &(addr, len) in prdt {
        let n = len.min(total - data.len());
        data.extend_from_slice(unsafe { &read_bytes(addr, n) });
        if data.len() == total {
            break;
        }
    }
    data
}

unsafe fn read_u32(addr: usize) -> u32 {
    std::ptr::read_volatile(addr as *const u32)
}

unsafe fn write_u32(addr: usize, value: u32) {
    std::ptr::write_volatile(addr as *mut u32, value)
}

unsafe fn read_bytes(addr: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(addr as *const u8, len).to_vec()
}

/// Register window onto the simulated controller
struct SimWindow {
    hba: Arc<SimHba>,
    /// BAR offset of the window start
    base: usize,
    size: usize,
}

impl RegisterIo for SimWindow {
    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        self.hba.read(self.base + offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size);
        self.hba.write(self.base + offset, value)
    }
}

/// Hands out windows onto a [`SimHba`] and connects its interrupt line
pub struct SimBroker {
    hba: Arc<SimHba>,
    irqs: Mutex<Vec<u32>>,
    mappings: Mutex<Vec<(usize, usize)>>,
}

impl SimBroker {
    pub fn new(hba: Arc<SimHba>) -> Self {
        Self {
            hba,
            irqs: Mutex::new(Vec::new()),
            mappings: Mutex::new(Vec::new()),
        }
    }

    /// (address, size) of every register mapping handed out
    pub fn mappings(&self) -> Vec<(usize, usize)> {
        self.mappings.lock().unwrap().clone()
    }
}

impl ResourceBroker for SimBroker {
    fn map_mmio(&self, paddr: usize, size: usize) -> vrt_hw::Result<Arc<dyn RegisterIo>> {
        if paddr < BAR || paddr + size > BAR + 0x2000 {
            return Err(HwError::NoSuchRegion { paddr });
        }
        self.mappings.lock().unwrap().push((paddr, size));
        Ok(Arc::new(SimWindow {
            hba: Arc::clone(&self.hba),
            base: paddr - BAR,
            size,
        }))
    }

    fn request_irq(&self, gsi: u32) -> vrt_hw::Result<IrqLine> {
        let mut irqs = self.irqs.lock().unwrap();
        if irqs.contains(&gsi) {
            return Err(HwError::IrqAlreadyAllocated { gsi });
        }
        irqs.push(gsi);
        let line = IrqLine::new(gsi);
        self.hba.lock().irq = Some(line.trigger());
        Ok(line)
    }

    fn allocate_dma(&self, size: usize, align: usize) -> vrt_hw::Result<DmaRegion> {
        DmaRegion::allocate(size, align)
    }
}

/// Zero-filled DMA buffer of `sectors` sectors
pub fn buffer(sectors: usize) -> Arc<DmaRegion> {
    Arc::new(DmaRegion::allocate(sectors * SECTOR, 4096).unwrap())
}

/// Poll until `cond` holds or a generous deadline passes
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    cond()
}
