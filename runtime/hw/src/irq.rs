//! IRQ Handling - Interrupt delivery to driver threads
//!
//! An interrupt line is what a driver's interrupt thread blocks on. The host
//! side keeps an [`IrqTrigger`] for the line and fires it whenever the GSI is
//! signalled; the driver thread receives [`IrqEvent::Interrupt`] and services
//! the device.
//!
//! Besides hardware interrupts the line carries two software events:
//! `Kick` lets a submitting thread ask the interrupt thread to rescan the
//! device, and `Shutdown` terminates the thread when the driver is torn down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

/// Re-enables a GSI at the interrupt controller
pub type AckFn = Arc<dyn Fn(u32) + Send + Sync>;

/// Event delivered on an interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    /// The device raised its interrupt
    Interrupt,
    /// A driver thread asks for a rescan of the device state
    Kick,
    /// The owner of the line is shutting down
    Shutdown,
}

/// Receiving end of an interrupt line
pub struct IrqLine {
    gsi: u32,
    rx: Receiver<IrqEvent>,
    tx: Sender<IrqEvent>,
    ack: Option<AckFn>,
}

impl IrqLine {
    /// Create a line for global system interrupt `gsi`
    pub fn new(gsi: u32) -> Self {
        let (tx, rx) = channel::unbounded();
        Self { gsi, rx, tx, ack: None }
    }

    /// Create a line whose acknowledgements are forwarded to `ack`
    ///
    /// The host glue passes the call that unmasks the GSI at its
    /// interrupt controller.
    pub fn with_ack(gsi: u32, ack: AckFn) -> Self {
        Self {
            ack: Some(ack),
            ..Self::new(gsi)
        }
    }

    /// Get the GSI number
    pub fn gsi(&self) -> u32 {
        self.gsi
    }

    /// Handle that injects events into this line
    pub fn trigger(&self) -> IrqTrigger {
        IrqTrigger {
            gsi: self.gsi,
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next event (blocking)
    pub fn wait(&self) -> IrqEvent {
        // `self.tx` keeps the channel connected, so recv only fails if the
        // line itself is gone; treat that as shutdown.
        self.rx.recv().unwrap_or(IrqEvent::Shutdown)
    }

    /// Wait for the next event for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<IrqEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(IrqEvent::Shutdown),
        }
    }

    /// Acknowledge the interrupt
    ///
    /// Must be called after the device has been serviced to re-enable the
    /// line at the interrupt controller.
    pub fn acknowledge(&self) {
        log::trace!("GSI {} acknowledged", self.gsi);
        if let Some(ack) = &self.ack {
            ack(self.gsi);
        }
    }
}

impl fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqLine")
            .field("gsi", &self.gsi)
            .field("pending", &self.rx.len())
            .finish()
    }
}

/// Sending end of an interrupt line
#[derive(Debug, Clone)]
pub struct IrqTrigger {
    gsi: u32,
    tx: Sender<IrqEvent>,
}

impl IrqTrigger {
    /// Get the GSI number
    pub fn gsi(&self) -> u32 {
        self.gsi
    }

    /// Deliver a hardware interrupt
    pub fn fire(&self) {
        self.send(IrqEvent::Interrupt);
    }

    /// Ask the interrupt thread to rescan the device
    pub fn kick(&self) {
        self.send(IrqEvent::Kick);
    }

    /// Ask the interrupt thread to exit
    pub fn shutdown(&self) {
        self.send(IrqEvent::Shutdown);
    }

    fn send(&self, event: IrqEvent) {
        // The line holds a sender itself, so this only fails once the
        // receiving side has been dropped; nobody listens anymore then.
        if self.tx.send(event).is_err() {
            log::debug!("GSI {}: dropped {:?}, line closed", self.gsi, event);
        }
    }
}
