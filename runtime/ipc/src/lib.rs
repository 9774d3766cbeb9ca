//! Service IPC - Sessions, per-CPU client state and request dispatch
//!
//! # Purpose
//! Long-lived services (timer, storage) serve many clients from one worker
//! per CPU. This crate provides the pieces such a service is built from:
//! the status vocabulary returned across the service boundary, request and
//! reply frames, a session table, and lazily populated per-CPU client state
//! that only its own CPU may create.
//!
//! # Integration Points
//! - Depends on: `vrt-base` (CPU identity, spin lock, notifications)
//! - Provides to: timer service, storage services
//! - IPC endpoints: one portal per service, invoked on the caller's CPU
//! - Capabilities required: None (transport is provided by the host)
//!
//! # Architecture
//! - [`Status`]: closed set of outcomes reported to clients
//! - [`Request`] / [`Reply`]: word-based message frames
//! - [`PerCpu`]: per-CPU slots with owner-CPU enforcement
//! - [`Service`] / [`Portal`]: session table and fault-isolating dispatch
//!
//! # Testing Strategy
//! - Unit tests: frame decoding, slot ownership, status mapping
//! - Integration tests: timer service end to end (`vrt-timer`)

mod frame;
mod percpu;
mod service;
mod status;

use thiserror::Error;
use vrt_base::CpuId;

pub use frame::{Handle, Reply, Request};
pub use percpu::PerCpu;
pub use service::{Portal, Service, SessionId};
pub use status::Status;

/// Error types for service requests
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Malformed request: expected word {index}, message has {len}")]
    Truncated { index: usize, len: usize },

    #[error("Malformed request: {extra} unexpected trailing words")]
    TrailingWords { extra: usize },

    #[error("Unknown operation code {opcode:#x}")]
    UnknownOpcode { opcode: u64 },

    #[error("Per-CPU state of CPU{owner} accessed from {current:?}")]
    CrossCpu { owner: CpuId, current: Option<CpuId> },

    #[error("CPU{cpu} is not served by this service")]
    NoSuchCpu { cpu: CpuId },

    #[error("Unknown session {id}")]
    UnknownSession { id: SessionId },

    #[error("{message}")]
    Service { status: Status, message: String },
}

impl IpcError {
    /// Status reported to the client for this error
    pub fn status(&self) -> Status {
        match self {
            IpcError::Truncated { .. } | IpcError::TrailingWords { .. } => Status::InvalidArgument,
            IpcError::UnknownSession { .. } => Status::InvalidArgument,
            IpcError::NoSuchCpu { .. } => Status::ResourceUnavailable,
            IpcError::UnknownOpcode { .. } | IpcError::CrossCpu { .. } => Status::InternalFault,
            IpcError::Service { status, .. } => *status,
        }
    }
}

pub type Result<T> = core::result::Result<T, IpcError>;
