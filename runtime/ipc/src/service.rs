//! Service - Session table and portal dispatch
//!
//! A service owns a table of client sessions and a [`Portal`] that handles
//! requests. Requests arrive on the worker thread of the caller's CPU and
//! are dispatched to the portal with the caller's session. Whatever goes
//! wrong inside the portal, an error or a panic, is turned into an error
//! [`Status`] here; nothing propagates across the service boundary.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vrt_base::{cpu, CpuSet, SpinLock};

use crate::{IpcError, Reply, Request, Result, Status};

/// Session identifier
pub type SessionId = usize;

/// Request handler of a service
pub trait Portal: Send + Sync {
    /// Per-client session data
    type Session: Send + Sync;

    /// Create the data for a new session
    fn create_session(&self, id: SessionId, args: &str, cpus: CpuSet) -> Result<Self::Session>;

    /// Handle one request of `session` on the current CPU
    fn handle(&self, session: &Self::Session, request: &mut Request) -> Result<Reply>;
}

/// Service with a session table
pub struct Service<P: Portal> {
    name: String,
    cpus: CpuSet,
    portal: P,
    sessions: SpinLock<BTreeMap<SessionId, Arc<P::Session>>>,
    next_id: AtomicUsize,
}

impl<P: Portal> Service<P> {
    /// Create a service named `name` served on `cpus`
    pub fn new(name: impl Into<String>, cpus: CpuSet, portal: P) -> Self {
        Self {
            name: name.into(),
            cpus,
            portal,
            sessions: SpinLock::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpus(&self) -> CpuSet {
        self.cpus
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    /// Open a session for a new client
    pub fn open_session(&self, args: &str) -> Result<SessionId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let data = self.portal.create_session(id, args, self.cpus)?;
        self.sessions.lock().insert(id, Arc::new(data));
        log::debug!("{}: opened session {} ({:?})", self.name, id, args);
        Ok(id)
    }

    /// Close a session
    ///
    /// Requests of this session already being handled finish normally; the
    /// session data is dropped after the last of them.
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        let removed = self.sessions.lock().remove(&id);
        match removed {
            Some(_) => {
                log::debug!("{}: closed session {}", self.name, id);
                Ok(())
            }
            None => Err(IpcError::UnknownSession { id }),
        }
    }

    /// Look up the data of session `id`
    pub fn session(&self, id: SessionId) -> Option<Arc<P::Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Dispatch one request of session `id`
    ///
    /// Always produces exactly one reply.
    pub fn call(&self, id: SessionId, mut request: Request) -> Reply {
        match cpu::current() {
            Some(c) if self.cpus.contains(c) => {}
            other => {
                log::error!("{}: call on {:?}, which this service does not serve", self.name, other);
                return Reply::error(Status::InternalFault);
            }
        }

        let Some(session) = self.session(id) else {
            log::warn!("{}: request for unknown session {}", self.name, id);
            return Reply::error(Status::InvalidArgument);
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.portal.handle(&session, &mut request)
        }));

        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                log::warn!("{}: session {}: {}", self.name, id, err);
                Reply::error(err.status())
            }
            Err(_) => {
                log::error!("{}: session {}: portal panicked", self.name, id);
                Reply::error(Status::InternalFault)
            }
        }
    }
}
