//! Message bus
//!
//! A bus is an append-only list of receivers for one message type.
//! Publishing offers the message to each receiver in registration order and
//! stops at the first one that claims it. Receivers may fill in results in
//! the message, so one message carries both the request and the answer.
//!
//! Buses are not thread-safe (`Rc` receivers, `RefCell` list). A receiver
//! may publish on any bus, this one included, and may subscribe new
//! receivers while a publication is running; those see later messages.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Handler of one message type
pub trait Receiver<M> {
    /// Offer `msg` to the receiver; `true` claims it and ends the publication
    fn receive(&self, msg: &mut M) -> bool;
}

struct FnReceiver<F>(F);

impl<M, F> Receiver<M> for FnReceiver<F>
where
    F: Fn(&mut M) -> bool,
{
    fn receive(&self, msg: &mut M) -> bool {
        (self.0)(msg)
    }
}

/// Bus for messages of type `M`
pub struct Bus<M> {
    receivers: RefCell<Vec<Rc<dyn Receiver<M>>>>,
}

impl<M> Bus<M> {
    pub fn new() -> Self {
        Self {
            receivers: RefCell::new(Vec::new()),
        }
    }

    /// Append `receiver` to the bus
    pub fn subscribe(&self, receiver: Rc<dyn Receiver<M>>) {
        self.receivers.borrow_mut().push(receiver);
    }

    /// Append a closure receiver
    pub fn subscribe_fn<F>(&self, f: F)
    where
        F: Fn(&mut M) -> bool + 'static,
        M: 'static,
    {
        self.subscribe(Rc::new(FnReceiver(f)));
    }

    /// Offer `msg` to the receivers in order
    ///
    /// Returns `false` if no receiver claimed the message.
    pub fn publish(&self, msg: &mut M) -> bool {
        let mut index = 0;
        loop {
            // The list is not borrowed while a receiver runs
            let receiver = self.receivers.borrow().get(index).cloned();
            let Some(receiver) = receiver else {
                return false;
            };
            if receiver.receive(msg) {
                return true;
            }
            index += 1;
        }
    }

    /// Number of receivers
    pub fn len(&self) -> usize {
        self.receivers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M> Default for Bus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Bus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus").field("receivers", &self.len()).finish()
    }
}
