//! Hardware session pool
//!
//! Authenticated device sessions are expensive to open, so they are kept
//! idle between operations and lent out one caller at a time. Idle and
//! active bookkeeping lives behind a single lock; every pool operation is
//! atomic with respect to every other.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};

use crate::device::Device;
use crate::error::RsspError;

pub type SessionId = u64;

struct PoolState<S> {
    idle: VecDeque<(SessionId, S)>,
    active: HashSet<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
}

pub struct SessionPool<D: Device> {
    device: Arc<D>,
    state: Mutex<PoolState<D::Session>>,
    next_id: AtomicU64,
}

/// A session lent to exactly one caller.
///
/// Dropping the lease releases the session back to the idle set, so every
/// exit path of an operation returns it.
pub struct SessionLease<D: Device> {
    pool: Arc<SessionPool<D>>,
    id: SessionId,
    session: Option<D::Session>,
}

impl<D: Device> SessionPool<D> {
    pub fn new(device: Arc<D>) -> Arc<Self> {
        Arc::new(Self {
            device,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: HashSet::new(),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState<D::Session>>, RsspError> {
        self.state
            .lock()
            .map_err(|_| RsspError::DeviceError("Session pool lock poisoned".into()))
    }

    fn open(&self) -> Result<(SessionId, D::Session), RsspError> {
        let session = self
            .device
            .open_session()
            .map_err(|e| RsspError::DeviceUnavailable(e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "Opened device session");
        Ok((id, session))
    }

    /// Take an idle session, or open and authenticate a new one.
    pub fn acquire(self: &Arc<Self>) -> Result<SessionLease<D>, RsspError> {
        let mut state = self.lock()?;

        let (id, session) = match state.idle.pop_front() {
            Some(entry) => entry,
            None => self.open()?,
        };
        state.active.insert(id);

        Ok(SessionLease {
            pool: Arc::clone(self),
            id,
            session: Some(session),
        })
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: SessionLease<D>) {
        drop(lease);
    }

    fn return_session(&self, id: SessionId, session: D::Session) {
        let Ok(mut state) = self.state.lock() else {
            error!(session = id, "Session pool lock poisoned, dropping session");
            return;
        };
        if !state.active.remove(&id) {
            warn!(session = id, "Session not active");
        }
        state.idle.push_back((id, session));
    }

    /// Retire a session for good.
    ///
    /// When this would leave no idle session and at most one active one, a
    /// replacement is opened and parked idle first so the device never sees
    /// its last session close and logs the process out. If the replacement
    /// cannot be opened the lease is released untouched and stays usable.
    pub fn close(&self, mut lease: SessionLease<D>) -> Result<(), RsspError> {
        let id = lease.id;
        let mut state = self.lock()?;
        if state.idle.is_empty() && state.active.len() <= 1 {
            let replacement = self.open().map_err(|e| {
                warn!(session = id, "No replacement session, keeping session open: {}", e);
                RsspError::DeviceError(e.to_string())
            })?;
            debug!(
                session = replacement.0,
                "Parked replacement session before close"
            );
            state.idle.push_back(replacement);
        }

        let Some(session) = lease.session.take() else {
            return Ok(());
        };
        state.active.remove(&id);
        drop(state);

        self.device.close_session(session).map_err(|e| {
            warn!(session = id, "Failed to close device session: {}", e);
            RsspError::DeviceError(e.to_string())
        })?;
        debug!(session = id, "Closed device session");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.state
            .lock()
            .map(|state| PoolStats {
                idle: state.idle.len(),
                active: state.active.len(),
            })
            .unwrap_or(PoolStats { idle: 0, active: 0 })
    }

    /// Close every idle session. Used on shutdown.
    pub fn shutdown(&self) {
        let idle: Vec<_> = match self.state.lock() {
            Ok(mut state) => state.idle.drain(..).collect(),
            Err(_) => return,
        };
        for (id, session) in idle {
            if let Err(e) = self.device.close_session(session) {
                warn!(session = id, "Failed to close device session: {}", e);
            }
        }
    }
}

impl<D: Device> SessionLease<D> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session(&self) -> &D::Session {
        // Only `close` takes the session out, and it consumes the lease.
        match &self.session {
            Some(session) => session,
            None => unreachable!("session lease used after close"),
        }
    }
}

impl<D: Device> Drop for SessionLease<D> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_session(self.id, session);
        }
    }
}
