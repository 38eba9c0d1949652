//! Single-client session admission.
//!
//! The gate is the one source of truth for "is an operator connected".  It
//! tracks at most one open [`Session`] at any instant; a second connection
//! attempt is refused and the caller must notify and close the candidate
//! transport itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Handle for one remote connection.  Clones share the open/closed flag.
#[derive(Debug, Clone, Default)]
pub struct Session {
    closed: Arc<AtomicBool>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }
}

/// Admits at most one open session at a time.
#[derive(Debug, Default)]
pub struct SessionGate {
    active: Mutex<Option<Session>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit `candidate`.
    ///
    /// A tracked session that has since closed is pruned first.  Returns
    /// `false` while another session is open, and the caller must send the
    /// rejection notice and close the candidate's transport immediately.
    pub fn try_admit(&self, candidate: &Session) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(Session::is_closed) {
            *active = None;
        }
        if active.is_some() {
            false
        } else {
            *active = Some(candidate.clone());
            true
        }
    }

    /// Untrack `session` and mark it closed.  Safe to call more than once
    /// and for sessions that were never admitted.
    pub fn release(&self, session: &Session) {
        session.mark_closed();
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|s| s.is_same(session)) {
            *active = None;
        }
    }

    /// Whether an open session is currently tracked.
    pub fn is_active(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(Session::is_closed) {
            *active = None;
        }
        active.is_some()
    }
}
