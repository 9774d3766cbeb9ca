//! Motherboard - The composition root of a virtual machine
//!
//! Holds one bus per message type and the clock all devices share. Devices
//! keep themselves alive through their bus subscriptions; the motherboard
//! never refers to a device directly.

use vrt_base::Clock;

use crate::message::*;
use crate::Bus;

/// Frequency of the shared device clock in Hz
pub const DEFAULT_CLOCK_FREQUENCY: u64 = 1_000;

/// Bus set and clock of one virtual machine
#[derive(Debug)]
pub struct Motherboard {
    clock: Clock,
    disk: Bus<MessageDisk>,
    diskcommit: Bus<MessageDiskCommit>,
    hostirq: Bus<MessageHostIrq>,
    irqlines: Bus<MessageIrqLines>,
    irqnotify: Bus<MessageIrqNotify>,
    ioin: Bus<MessageIoIn>,
    ioout: Bus<MessageIoOut>,
    mem: Bus<MessageMem>,
    time: Bus<MessageTime>,
    timer: Bus<MessageTimer>,
    timeout: Bus<MessageTimeout>,
    hostop: Bus<MessageHostOp>,
}

impl Motherboard {
    pub fn new() -> Self {
        Self::with_clock(Clock::new(DEFAULT_CLOCK_FREQUENCY))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            disk: Bus::new(),
            diskcommit: Bus::new(),
            hostirq: Bus::new(),
            irqlines: Bus::new(),
            irqnotify: Bus::new(),
            ioin: Bus::new(),
            ioout: Bus::new(),
            mem: Bus::new(),
            time: Bus::new(),
            timer: Bus::new(),
            timeout: Bus::new(),
            hostop: Bus::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn bus_disk(&self) -> &Bus<MessageDisk> {
        &self.disk
    }

    pub fn bus_diskcommit(&self) -> &Bus<MessageDiskCommit> {
        &self.diskcommit
    }

    pub fn bus_hostirq(&self) -> &Bus<MessageHostIrq> {
        &self.hostirq
    }

    pub fn bus_irqlines(&self) -> &Bus<MessageIrqLines> {
        &self.irqlines
    }

    pub fn bus_irqnotify(&self) -> &Bus<MessageIrqNotify> {
        &self.irqnotify
    }

    pub fn bus_ioin(&self) -> &Bus<MessageIoIn> {
        &self.ioin
    }

    pub fn bus_ioout(&self) -> &Bus<MessageIoOut> {
        &self.ioout
    }

    pub fn bus_mem(&self) -> &Bus<MessageMem> {
        &self.mem
    }

    pub fn bus_time(&self) -> &Bus<MessageTime> {
        &self.time
    }

    pub fn bus_timer(&self) -> &Bus<MessageTimer> {
        &self.timer
    }

    pub fn bus_timeout(&self) -> &Bus<MessageTimeout> {
        &self.timeout
    }

    pub fn bus_hostop(&self) -> &Bus<MessageHostOp> {
        &self.hostop
    }
}

impl Default for Motherboard {
    fn default() -> Self {
        Self::new()
    }
}
