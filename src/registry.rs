//! Process-wide table of live station sessions.
//!
//! The registry is an explicitly constructed value shared by cloning. Holds at
//! most one session per station name: registering a second one closes the first.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::session::{CloseReason, SequenceTracker, SessionHandle, SessionStatus};

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Sequence state of closed sessions, kept only when resuming is enabled.
    retained: Mutex<HashMap<String, SequenceTracker>>,
    resume_gap_state: bool,
}

/// Station name to live session. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// `resume_gap_state` carries a station's sequence state over to its next session.
    pub fn new(resume_gap_state: bool) -> Self {
        Self { inner: Arc::new(RegistryInner { resume_gap_state, ..Default::default() }) }
    }

    pub fn resumes_gap_state(&self) -> bool {
        self.inner.resume_gap_state
    }

    /// Install `handle`, closing any session already registered for its station.
    ///
    /// Returns the replaced session. A session that is already closing is not
    /// installed: its teardown may have run before it reached the table.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let station = handle.station().to_string();
        let mut sessions = self.inner.sessions.lock();
        // checked under the lock that `release` takes after a session starts closing
        if handle.is_closing() {
            debug!(station = %station, session = handle.id(), "not registering a closing session");
            return None;
        }
        let previous = sessions.remove(&station);
        if let Some(previous) = &previous {
            info!(station = %station, old = previous.id(), new = handle.id(), "replacing live session");
            previous.close_with(CloseReason::Replaced);
        }
        debug!(station = %station, session = handle.id(), "registered session");
        sessions.insert(station, handle);
        previous
    }

    pub fn lookup(&self, station: &str) -> Option<SessionHandle> {
        self.inner.sessions.lock().get(station).cloned()
    }

    /// Remove a station's session from the table without closing it.
    pub fn unregister(&self, station: &str) -> Option<SessionHandle> {
        self.inner.sessions.lock().remove(station)
    }

    /// Called by a closing session. Only removes the entry if it is still that session.
    pub(crate) fn release(&self, station: &str, session_id: u64, tracker: SequenceTracker) {
        let removed = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get(station) {
                Some(current) if current.id() == session_id => sessions.remove(station).is_some(),
                _ => false,
            }
        };

        // a replaced session's successor already owns the sequence state
        if removed && self.inner.resume_gap_state {
            debug!(station, last = ?tracker.last_contiguous(), gaps = tracker.gaps().len(), "retaining sequence state");
            self.inner.retained.lock().insert(station.to_string(), tracker);
        }
    }

    /// Sequence state to seed a new session for `station` with.
    ///
    /// Fresh unless resuming is enabled, in which case it is the retained state of the
    /// last closed session or a copy of the live one about to be replaced.
    pub fn initial_tracker(&self, station: &str) -> SequenceTracker {
        if !self.inner.resume_gap_state {
            return SequenceTracker::new();
        }
        if let Some(tracker) = self.inner.retained.lock().remove(station) {
            return tracker;
        }
        self.lookup(station).map(|live| live.tracker_snapshot()).unwrap_or_default()
    }

    pub fn stations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every live session, ordered by station name.
    pub fn statuses(&self) -> Vec<SessionStatus> {
        let handles: Vec<SessionHandle> = self.inner.sessions.lock().values().cloned().collect();
        let mut statuses: Vec<SessionStatus> = handles.iter().map(SessionHandle::status).collect();
        statuses.sort_by(|a, b| a.station.cmp(&b.station));
        statuses
    }

    /// Request every live session to close without waiting.
    pub fn close_all(&self) {
        for handle in self.inner.sessions.lock().values() {
            handle.close();
        }
    }

    /// Close every live session and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.inner.sessions.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(sessions = handles.len(), "closing all station sessions");
        for handle in &handles {
            handle.close();
        }
        join_all(handles.iter().map(SessionHandle::closed)).await;
    }
}
