//! Request and reply frames
//!
//! A request is a sequence of machine words, the first of which is the
//! operation code. Portals consume words in order and must call
//! [`Request::finish_input`] once they have read everything they expect;
//! anything missing or left over makes the request malformed.
//!
//! A reply carries a [`Status`], result words and delegated handles. Error
//! replies never carry results.

use std::sync::Arc;

use vrt_base::Notification;

use crate::{IpcError, Result, Status};

/// Capability handed to the client in a reply
pub type Handle = Arc<Notification>;

/// Incoming request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    words: Vec<u64>,
    pos: usize,
}

impl Request {
    /// Request with operation code `opcode` and no arguments
    pub fn new(opcode: u64) -> Self {
        Self {
            words: vec![opcode],
            pos: 0,
        }
    }

    /// Request from raw words as received from the transport
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words, pos: 0 }
    }

    /// Append an argument word
    pub fn arg(mut self, word: u64) -> Self {
        self.words.push(word);
        self
    }

    /// Consume the next word
    pub fn word(&mut self) -> Result<u64> {
        let word = self.words.get(self.pos).copied().ok_or(IpcError::Truncated {
            index: self.pos,
            len: self.words.len(),
        })?;
        self.pos += 1;
        Ok(word)
    }

    /// Check that every word of the request has been consumed
    pub fn finish_input(&self) -> Result<()> {
        let extra = self.words.len() - self.pos;
        if extra > 0 {
            return Err(IpcError::TrailingWords { extra });
        }
        Ok(())
    }
}

/// Outgoing reply
#[derive(Debug, Clone)]
pub struct Reply {
    status: Status,
    words: Vec<u64>,
    handles: Vec<Handle>,
}

impl Reply {
    /// Successful reply without results
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            words: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Error reply
    pub fn error(status: Status) -> Self {
        Self {
            status,
            words: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Append a result word
    pub fn push(&mut self, word: u64) -> &mut Self {
        self.words.push(word);
        self
    }

    /// Delegate a handle to the client
    pub fn delegate(&mut self, handle: Handle) -> &mut Self {
        self.handles.push(handle);
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    /// Take the delegated handles out of the reply
    pub fn into_handles(self) -> Vec<Handle> {
        self.handles
    }
}
