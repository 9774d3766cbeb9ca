//! Integration tests for hardware resources
//!
//! A small broker hands out register regions over host memory and
//! interrupt lines, the way the host microkernel glue does for real
//! devices.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vrt_hw::*;

/// Broker backed by a single block of host memory standing in for a BAR
struct MemoryBroker {
    bar_paddr: usize,
    backing: Arc<Vec<AtomicU32>>,
    claimed: Mutex<Vec<u32>>,
    acks: Arc<AtomicUsize>,
}

impl MemoryBroker {
    fn new(bar_paddr: usize, words: usize) -> Self {
        Self {
            bar_paddr,
            backing: Arc::new((0..words).map(|_| AtomicU32::new(0)).collect()),
            claimed: Mutex::new(Vec::new()),
            acks: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Window of `size` bytes at word `first` of the broker memory
struct Window {
    backing: Arc<Vec<AtomicU32>>,
    first: usize,
    size: usize,
}

impl Window {
    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.size, "offset {:#x}", offset);
        &self.backing[self.first + offset / 4]
    }
}

impl RegisterIo for Window {
    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::SeqCst)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::SeqCst)
    }
}

impl ResourceBroker for MemoryBroker {
    fn map_mmio(&self, paddr: usize, size: usize) -> Result<Arc<dyn RegisterIo>> {
        let offset = paddr
            .checked_sub(self.bar_paddr)
            .ok_or(HwError::NoSuchRegion { paddr })?;
        if offset % 4 != 0 || size == 0 || size % 4 != 0 {
            return Err(HwError::InvalidRegion { base: paddr, size });
        }
        if offset + size > self.backing.len() * 4 {
            return Err(HwError::NoSuchRegion { paddr });
        }
        Ok(Arc::new(Window {
            backing: Arc::clone(&self.backing),
            first: offset / 4,
            size,
        }))
    }

    fn request_irq(&self, gsi: u32) -> Result<IrqLine> {
        let mut claimed = self.claimed.lock().unwrap();
        if claimed.contains(&gsi) {
            return Err(HwError::IrqAlreadyAllocated { gsi });
        }
        claimed.push(gsi);
        let acks = Arc::clone(&self.acks);
        Ok(IrqLine::with_ack(
            gsi,
            Arc::new(move |_| {
                acks.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }
}

#[test]
fn test_two_mappings_share_device_memory() {
    let broker = MemoryBroker::new(0xfebf_0000, 0x2000 / 4);

    let low = broker.map_mmio(0xfebf_0000, 0x1000).unwrap();
    let high = broker.map_mmio(0xfebf_1000, 0x100).unwrap();

    high.write32(0x0, 0xabcd);
    assert_eq!(high.read32(0x0), 0xabcd);
    assert_eq!(low.size(), 0x1000);
    assert_eq!(high.size(), 0x100);

    // The high mapping starts where the low one ends
    let whole = broker.map_mmio(0xfebf_0000, 0x1100).unwrap();
    assert_eq!(whole.read32(0x1000), 0xabcd);
}

#[test]
fn test_mapping_outside_bar_rejected() {
    let broker = MemoryBroker::new(0xfebf_0000, 0x400);
    assert!(matches!(
        broker.map_mmio(0xfeb0_0000, 0x100),
        Err(HwError::NoSuchRegion { .. })
    ));
    assert!(matches!(
        broker.map_mmio(0xfebf_0000, 0x2000),
        Err(HwError::NoSuchRegion { .. })
    ));
    assert!(matches!(
        broker.map_mmio(0xfebf_0002, 0x100),
        Err(HwError::InvalidRegion { .. })
    ));
}

#[test]
#[should_panic]
fn test_access_past_window_panics() {
    let broker = MemoryBroker::new(0x1000, 16);
    let regs = broker.map_mmio(0x1000, 16).unwrap();
    regs.read32(16);
}

#[test]
fn test_irq_thread_workflow() {
    let broker = MemoryBroker::new(0x1000, 16);
    let line = broker.request_irq(11).unwrap();
    let trigger = line.trigger();

    assert!(matches!(
        broker.request_irq(11),
        Err(HwError::IrqAlreadyAllocated { gsi: 11 })
    ));

    let worker = thread::spawn(move || {
        let mut interrupts = 0;
        loop {
            match line.wait() {
                IrqEvent::Interrupt => {
                    interrupts += 1;
                    line.acknowledge();
                }
                IrqEvent::Kick => {}
                IrqEvent::Shutdown => break,
            }
        }
        interrupts
    });

    trigger.fire();
    trigger.kick();
    trigger.fire();
    trigger.shutdown();

    assert_eq!(worker.join().unwrap(), 2);
    assert_eq!(broker.acks.load(Ordering::SeqCst), 2);
}

#[test]
fn test_default_dma_allocation() {
    let broker = MemoryBroker::new(0x1000, 16);
    let dma = broker.allocate_dma(4096, 4096).unwrap();
    assert_eq!(dma.vaddr() % 4096, 0);
    dma.write(4000, b"sector").unwrap();

    let mut buf = [0u8; 6];
    dma.read(4000, &mut buf).unwrap();
    assert_eq!(&buf, b"sector");

    let line = IrqLine::new(1);
    assert_eq!(line.wait_timeout(Duration::from_millis(1)), None);
}
