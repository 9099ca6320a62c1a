//! Session registry.
//!
//! Maps caller-assigned ids to sessions and enforces the capacity limit. The
//! map sits behind one coarse mutex that is only held for lookups and map
//! mutations, never across driver I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::driver::{DriverFactory, DriverParams};
use super::interactive::{DrainSettings, Session, SessionError, SessionId, SessionState, SessionSummary};
use super::multiplexer::Broadcaster;
use crate::filter::OutputFilter;

/// Registry behaviour, usually derived from the `[session]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Maximum number of sessions held at once.
    pub capacity: usize,
    /// Reclaim the oldest stopped session when the registry is full.
    pub evict_stopped: bool,
    /// Lines sent to every session right after it starts.
    pub startup_commands: Vec<String>,
    pub drain: DrainSettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            capacity: 32,
            evict_stopped: true,
            startup_commands: Vec::new(),
            drain: DrainSettings::default(),
        }
    }
}

/// A broadcast target that did not receive its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTarget {
    pub session_id: SessionId,
    pub reason: String,
}

/// Outcome of [`SessionRegistry::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    /// Sessions that received every input.
    pub delivered: Vec<SessionId>,
    pub skipped: Vec<SkippedTarget>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    settings: RegistrySettings,
    filter: Arc<OutputFilter>,
    broadcaster: Arc<dyn Broadcaster>,
    drivers: Arc<dyn DriverFactory>,
}

impl SessionRegistry {
    pub fn new(
        settings: RegistrySettings,
        filter: OutputFilter,
        broadcaster: Arc<dyn Broadcaster>,
        drivers: Arc<dyn DriverFactory>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            settings,
            filter: Arc::new(filter),
            broadcaster,
            drivers,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    /// Returns the session registered under `id`, creating it in the
    /// `Created` state if there is none.
    ///
    /// A full registry either reclaims its oldest stopped session or rejects
    /// the insert with `CapacityExceeded`, leaving the map untouched.
    pub fn create_or_get(&self, id: &str, params: &DriverParams) -> Result<Arc<Session>, SessionError> {
        let (session, evicted) = {
            let mut sessions = self.sessions();
            if let Some(existing) = sessions.get(id) {
                return Ok(Arc::clone(existing));
            }

            let evicted = self.make_room(&mut sessions)?;
            let session = self.new_session(id, params);
            sessions.insert(id.to_string(), Arc::clone(&session));
            (session, evicted)
        };

        if let Some(old) = evicted {
            self.reclaim(&old, true);
        }

        tracing::info!(session_id = %id, kind = ?params.kind(), "Session created");
        Ok(session)
    }

    /// Creates the session if needed, starts it and its drain loop, then sends
    /// the startup commands.
    ///
    /// An already active session is returned unchanged. If the start fails,
    /// the entry is removed so it does not hold a slot.
    pub async fn start_session(
        &self,
        id: &str,
        params: &DriverParams,
    ) -> Result<Arc<Session>, SessionError> {
        let session = self.create_or_get(id, params)?;
        match session.state() {
            SessionState::Active => return Ok(session),
            SessionState::Inactive => return Err(SessionError::InactiveSession(id.to_string())),
            SessionState::Created => {}
        }
        self.activate(session).await
    }

    /// Replaces the entry for `id` with a fresh session and starts it.
    ///
    /// The previous session, if any, is stopped. Its observers stay in the
    /// room and see the new session's output.
    pub async fn restart_session(
        &self,
        id: &str,
        params: &DriverParams,
    ) -> Result<Arc<Session>, SessionError> {
        let (session, previous, evicted) = {
            let mut sessions = self.sessions();
            let evicted = if sessions.contains_key(id) {
                None
            } else {
                self.make_room(&mut sessions)?
            };

            let session = self.new_session(id, params);
            let previous = sessions.insert(id.to_string(), Arc::clone(&session));
            (session, previous, evicted)
        };

        if let Some(old) = previous {
            self.reclaim(&old, false);
        }
        if let Some(old) = evicted {
            self.reclaim(&old, true);
        }

        tracing::info!(session_id = %id, "Restarting session");
        self.activate(session).await
    }

    pub fn stop_session(&self, id: &str) -> Result<(), SessionError> {
        self.get(id)?.stop()
    }

    /// Stops the session if active, removes it, and closes its room.
    /// Terminating an unknown id is a no-op.
    pub fn terminate(&self, id: &str) {
        let removed = self.sessions().remove(id);
        match removed {
            Some(session) => {
                self.reclaim(&session, true);
                tracing::info!(session_id = %id, "Session terminated");
            }
            None => tracing::debug!(session_id = %id, "Terminate for unknown session ignored"),
        }
    }

    pub fn send_input(&self, id: &str, text: &str) -> Result<(), SessionError> {
        self.get(id)?.send_input(text)
    }

    /// Sends every input, in order, to every target. `None` targets all
    /// registered sessions. Unknown or inactive targets are skipped.
    pub fn broadcast(&self, targets: Option<&[SessionId]>, inputs: &[String]) -> BroadcastReport {
        let targets: Vec<SessionId> = match targets {
            Some(targets) => targets.to_vec(),
            None => {
                let mut ids: Vec<SessionId> = self.sessions().keys().cloned().collect();
                ids.sort();
                ids
            }
        };

        let mut report = BroadcastReport::default();

        'targets: for id in targets {
            let session = match self.get(&id) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Skipping broadcast target");
                    report.skipped.push(SkippedTarget {
                        session_id: id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            for input in inputs {
                if let Err(e) = session.send_input(input) {
                    tracing::warn!(session_id = %id, error = %e, "Skipping broadcast target");
                    report.skipped.push(SkippedTarget {
                        session_id: id,
                        reason: e.to_string(),
                    });
                    continue 'targets;
                }
            }
            report.delivered.push(id);
        }

        tracing::debug!(
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            "Broadcast complete"
        );
        report
    }

    /// Summaries of every session, ordered by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn history(&self, id: &str) -> Result<Vec<String>, SessionError> {
        Ok(self.get(id)?.history())
    }

    /// Terminates every session.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for session in drained {
            self.reclaim(&session, true);
        }
        tracing::info!(count, "All sessions terminated");
    }

    fn new_session(&self, id: &str, params: &DriverParams) -> Arc<Session> {
        Arc::new(Session::new(
            id.to_string(),
            params.kind(),
            self.drivers.build(params),
            Arc::clone(&self.filter),
            Arc::clone(&self.broadcaster),
        ))
    }

    /// Makes space for one more entry, evicting the oldest stopped session
    /// if allowed. The evicted session is returned so it can be reclaimed
    /// after the map lock is released.
    fn make_room(
        &self,
        sessions: &mut HashMap<SessionId, Arc<Session>>,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        if sessions.len() < self.settings.capacity {
            return Ok(None);
        }

        let capacity_exceeded = SessionError::CapacityExceeded {
            capacity: self.settings.capacity,
        };
        if !self.settings.evict_stopped {
            return Err(capacity_exceeded);
        }

        let oldest_stopped = sessions
            .values()
            .filter(|s| s.state() == SessionState::Inactive)
            .min_by_key(|s| s.stopped_at())
            .map(|s| s.id().clone());

        match oldest_stopped {
            Some(id) => {
                tracing::info!(session_id = %id, "Evicting stopped session to free capacity");
                Ok(sessions.remove(&id))
            }
            None => Err(capacity_exceeded),
        }
    }

    async fn activate(&self, session: Arc<Session>) -> Result<Arc<Session>, SessionError> {
        let starting = Arc::clone(&session);
        let started = tokio::task::spawn_blocking(move || starting.start())
            .await
            .unwrap_or_else(|e| Err(SessionError::DriverIo(format!("start task failed: {}", e))));

        match started {
            Ok(()) => {}
            // Lost a race with a concurrent start.
            Err(SessionError::AlreadyActive(_)) => return Ok(session),
            Err(e) => {
                self.remove_if_same(&session);
                return Err(e);
            }
        }

        // Terminated, restarted or shut down while the driver was starting.
        if !self.is_current(&session) {
            session.retire();
            return Err(SessionError::InactiveSession(session.id().clone()));
        }

        session.start_drain_loop(self.settings.drain.clone());

        for command in &self.settings.startup_commands {
            if let Err(e) = session.send_input(command) {
                tracing::warn!(session_id = %session.id(), error = %e, "Startup command failed");
                break;
            }
        }

        Ok(session)
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.sessions()
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    fn remove_if_same(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions();
        if sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.id());
            tracing::debug!(session_id = %session.id(), "Removed session that failed to start");
        }
    }

    /// Retires a session that has left the map and optionally closes its
    /// room. A start still in flight for it fails and releases its driver.
    fn reclaim(&self, session: &Session, close_room: bool) {
        session.retire();
        if close_room {
            self.broadcaster.close_room(session.id());
        }
    }
}
