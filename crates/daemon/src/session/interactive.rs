//! A single interactive session and its drain loop.
//!
//! A session owns one driver exclusively. The control plane (start, stop,
//! send) and the session's own drain loop are the only two actors touching
//! the driver; both go through the driver mutex. `stop()` flips the state
//! before terminating the driver, and the drain loop re-checks the state
//! around every read, so a stop never has to wait for more than one bounded
//! read.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::driver::{DriverError, DriverKind, InteractiveDriver};
use super::multiplexer::Broadcaster;
use crate::filter::OutputFilter;

/// Caller-assigned session identifier.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The remote side rejected the login.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The registry is full and nothing could be reclaimed.
    #[error("capacity exceeded: {capacity} sessions already registered")]
    CapacityExceeded { capacity: usize },

    /// No session with this id is registered.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session is not in the `Active` state.
    #[error("session is not active: {0}")]
    InactiveSession(SessionId),

    /// The session was already started.
    #[error("session already active: {0}")]
    AlreadyActive(SessionId),

    /// The driver failed unexpectedly.
    #[error("driver I/O error: {0}")]
    DriverIo(String),

    /// The process or connection could not be established.
    #[error("failed to spawn: {0}")]
    SpawnFailed(String),
}

impl From<DriverError> for SessionError {
    fn from(error: DriverError) -> Self {
        match error {
            DriverError::AuthenticationFailed(reason) => SessionError::AuthenticationFailed(reason),
            DriverError::Spawn(reason) => SessionError::SpawnFailed(reason),
            other => SessionError::DriverIo(other.to_string()),
        }
    }
}

/// Lifecycle state of a session. Transitions only ever move forward:
/// `Created -> Active -> Inactive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Inactive,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Active => 1,
            SessionState::Inactive => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Active,
            _ => SessionState::Inactive,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Tuning for the drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSettings {
    /// Maximum bytes pulled from the driver per read.
    pub chunk_size: usize,
    /// How long a single read may wait for output.
    pub read_timeout: Duration,
    /// Pause between reads when no output was available.
    pub poll_interval: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            read_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Point-in-time description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub kind: DriverKind,
    /// Driver label, e.g. `local:/bin/sh`.
    pub driver: String,
    /// Unix timestamp (seconds) when the session was created.
    pub created_at: u64,
    /// Number of filtered chunks retained in history.
    pub history_chunks: usize,
    /// Set when the drain loop gave up after a driver failure.
    pub output_closed: bool,
}

/// Filtered output retained for late joiners, plus any trailing bytes of an
/// incomplete UTF-8 sequence waiting for the next read.
#[derive(Default)]
struct History {
    chunks: Vec<String>,
    carry: Vec<u8>,
}

impl History {
    /// Decodes `data`, keeping an incomplete trailing sequence for later.
    fn decode(&mut self, data: &[u8]) -> String {
        self.carry.extend_from_slice(data);

        match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let text = text.to_string();
                self.carry.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let tail = self.carry.split_off(e.valid_up_to());
                let text = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry = tail;
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry.clear();
                text
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One managed interactive process or connection.
pub struct Session {
    id: SessionId,
    kind: DriverKind,
    label: String,
    driver: Mutex<Box<dyn InteractiveDriver>>,
    state: AtomicU8,
    history: Mutex<History>,
    filter: Arc<OutputFilter>,
    broadcaster: Arc<dyn Broadcaster>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    output_closed: AtomicBool,
    created_at: u64,
    stopped_at: Mutex<Option<Instant>>,
}

impl Session {
    /// Creates a session in the `Created` state. The driver is not started.
    pub fn new(
        id: SessionId,
        kind: DriverKind,
        driver: Box<dyn InteractiveDriver>,
        filter: Arc<OutputFilter>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let label = driver.describe();
        Self {
            id,
            kind,
            label,
            driver: Mutex::new(driver),
            state: AtomicU8::new(SessionState::Created.as_u8()),
            history: Mutex::new(History::default()),
            filter,
            broadcaster,
            drain_task: Mutex::new(None),
            output_closed: AtomicBool::new(false),
            created_at: now_secs(),
            stopped_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Whether the drain loop stopped early because the driver failed.
    pub fn output_closed(&self) -> bool {
        self.output_closed.load(Ordering::SeqCst)
    }

    /// When the session was stopped, if it was.
    pub fn stopped_at(&self) -> Option<Instant> {
        *lock(&self.stopped_at)
    }

    /// Starts the driver. Only valid from `Created`.
    ///
    /// On failure the session stays `Created` and the driver error is
    /// returned to the caller.
    pub fn start(&self) -> Result<(), SessionError> {
        self.check_startable()?;

        let mut driver = lock(&self.driver);
        // Another caller may have started it while we waited for the lock.
        self.check_startable()?;

        if let Err(e) = driver.start() {
            tracing::error!(session_id = %self.id, error = %e, "Failed to start session");
            return Err(e.into());
        }

        // A retire() during the driver start wins; the fresh driver goes too.
        if self
            .state
            .compare_exchange(
                SessionState::Created.as_u8(),
                SessionState::Active.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            driver.terminate();
            tracing::info!(session_id = %self.id, "Session retired while starting");
            return Err(SessionError::InactiveSession(self.id.clone()));
        }

        tracing::info!(session_id = %self.id, driver = %self.label, "Session started");
        Ok(())
    }

    /// Takes the session out of service whatever its state.
    ///
    /// An active session is stopped. A session that has not finished
    /// starting becomes `Inactive` without waiting for the driver, and its
    /// pending `start()` terminates the driver and fails.
    pub fn retire(&self) {
        if self
            .state
            .compare_exchange(
                SessionState::Created.as_u8(),
                SessionState::Inactive.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            *lock(&self.stopped_at) = Some(Instant::now());
            tracing::debug!(session_id = %self.id, "Retired session before it started");
            return;
        }

        if let Err(e) = self.stop() {
            tracing::debug!(session_id = %self.id, error = %e, "Session already stopped");
        }
    }

    fn check_startable(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Created => Ok(()),
            SessionState::Active => Err(SessionError::AlreadyActive(self.id.clone())),
            SessionState::Inactive => Err(SessionError::InactiveSession(self.id.clone())),
        }
    }

    /// Sends one line of input. Input to a session that is not active is
    /// rejected with `InactiveSession` and never reaches the driver.
    pub fn send_input(&self, text: &str) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::InactiveSession(self.id.clone()));
        }

        let mut driver = lock(&self.driver);
        if !self.is_active() {
            return Err(SessionError::InactiveSession(self.id.clone()));
        }

        tracing::debug!(session_id = %self.id, bytes = text.len(), "Sending input");
        driver.send(text).map_err(SessionError::from)
    }

    /// Reads once from the driver.
    ///
    /// New output is decoded, filtered, appended to history and published
    /// while the history lock is held, so observers joining through
    /// [`Session::with_history`] never miss or double-see a chunk.
    pub fn drain_once(
        &self,
        chunk_size: usize,
        timeout: Duration,
    ) -> Result<Option<String>, SessionError> {
        if !self.is_active() {
            return Err(SessionError::InactiveSession(self.id.clone()));
        }

        let mut driver = lock(&self.driver);
        if !self.is_active() {
            return Err(SessionError::InactiveSession(self.id.clone()));
        }

        let data = match driver.read_nonblocking(chunk_size, timeout) {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(DriverError::Terminated) | Err(DriverError::NotStarted) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !self.is_active() {
            tracing::trace!(session_id = %self.id, "Discarding output read during stop");
            return Ok(None);
        }

        let mut history = lock(&self.history);
        let text = history.decode(&data);
        let chunk = self.filter.apply(&text);
        if chunk.is_empty() {
            return Ok(None);
        }

        history.chunks.push(chunk.clone());
        self.broadcaster.publish(&self.id, &chunk);
        drop(history);
        drop(driver);

        Ok(Some(chunk))
    }

    /// Stops the session: state first, then the driver.
    pub fn stop(&self) -> Result<(), SessionError> {
        if self
            .state
            .compare_exchange(
                SessionState::Active.as_u8(),
                SessionState::Inactive.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(SessionError::InactiveSession(self.id.clone()));
        }

        *lock(&self.stopped_at) = Some(Instant::now());

        // Waits for at most one in-flight bounded read.
        lock(&self.driver).terminate();

        tracing::info!(session_id = %self.id, "Session stopped");
        Ok(())
    }

    /// Snapshot of the filtered output history.
    pub fn history(&self) -> Vec<String> {
        lock(&self.history).chunks.clone()
    }

    /// Runs `f` with the history while no new output can be recorded.
    pub fn with_history<R>(&self, f: impl FnOnce(&[String]) -> R) -> R {
        let history = lock(&self.history);
        f(&history.chunks)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state(),
            kind: self.kind,
            driver: self.label.clone(),
            created_at: self.created_at,
            history_chunks: lock(&self.history).chunks.len(),
            output_closed: self.output_closed(),
        }
    }

    /// Spawns the drain loop if the session is active and no loop is running.
    pub fn start_drain_loop(self: &Arc<Self>, settings: DrainSettings) {
        let mut slot = lock(&self.drain_task);

        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                tracing::warn!(session_id = %self.id, "Drain loop already running");
                return;
            }
        }

        if !self.is_active() {
            tracing::debug!(session_id = %self.id, "Not starting drain loop for inactive session");
            return;
        }

        let session = Arc::clone(self);
        *slot = Some(tokio::spawn(drain_loop(session, settings)));
    }

    /// Whether a drain loop task is currently running.
    pub fn is_draining(&self) -> bool {
        lock(&self.drain_task)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Waits for the drain loop to exit.
    pub async fn join_drain_loop(&self) {
        let handle = lock(&self.drain_task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(session_id = %self.id, error = %e, "Drain loop panicked");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("driver", &self.label)
            .finish_non_exhaustive()
    }
}

/// Repeatedly drains the session until it is no longer active.
///
/// Reads run on the blocking pool; an empty read yields for the poll
/// interval before trying again. A driver failure ends the loop but leaves
/// the session state alone; only `stop()` makes a session inactive.
async fn drain_loop(session: Arc<Session>, settings: DrainSettings) {
    tracing::debug!(session_id = %session.id, "Drain loop started");

    while session.is_active() {
        let reader = Arc::clone(&session);
        let chunk_size = settings.chunk_size;
        let read_timeout = settings.read_timeout;

        let result =
            tokio::task::spawn_blocking(move || reader.drain_once(chunk_size, read_timeout)).await;

        match result {
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => tokio::time::sleep(settings.poll_interval).await,
            Ok(Err(SessionError::InactiveSession(_))) => break,
            Ok(Err(e)) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Driver failed, no further output will be drained"
                );
                session.output_closed.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Drain read task panicked");
                session.output_closed.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    tracing::debug!(session_id = %session.id, "Drain loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::driver::testing::MockDriver;
    use crate::session::multiplexer::{RoomBroadcaster, RoomEvent};
    use crate::filter::FilterRule;

    fn crlf_filter() -> Arc<OutputFilter> {
        Arc::new(OutputFilter::new(vec![
            FilterRule::replace("\r", ""),
            FilterRule::replace("\n", "<br>"),
        ]))
    }

    fn session_with(driver: MockDriver) -> (Arc<Session>, Arc<RoomBroadcaster>) {
        let broadcaster = Arc::new(RoomBroadcaster::new());
        let session = Arc::new(Session::new(
            "x".to_string(),
            DriverKind::Local,
            Box::new(driver),
            crlf_filter(),
            broadcaster.clone(),
        ));
        (session, broadcaster)
    }

    #[test]
    fn test_state_path_created_active_inactive() {
        let (session, _) = session_with(MockDriver::new());
        let mut observed = vec![session.state()];

        session.start().unwrap();
        observed.push(session.state());

        assert!(matches!(session.start(), Err(SessionError::AlreadyActive(_))));
        observed.push(session.state());

        session.stop().unwrap();
        observed.push(session.state());

        assert!(matches!(session.stop(), Err(SessionError::InactiveSession(_))));
        assert!(matches!(session.start(), Err(SessionError::InactiveSession(_))));
        observed.push(session.state());

        assert_eq!(
            observed,
            vec![
                SessionState::Created,
                SessionState::Active,
                SessionState::Active,
                SessionState::Inactive,
                SessionState::Inactive,
            ]
        );
    }

    #[test]
    fn test_stop_before_start_is_rejected() {
        let (session, _) = session_with(MockDriver::new());
        assert!(matches!(session.stop(), Err(SessionError::InactiveSession(_))));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn test_retire_before_start_blocks_start() {
        let driver = MockDriver::new();
        let log = driver.log.clone();
        let (session, _) = session_with(driver);

        session.retire();

        assert_eq!(session.state(), SessionState::Inactive);
        assert!(session.stopped_at().is_some());
        assert!(matches!(session.start(), Err(SessionError::InactiveSession(_))));
        assert_eq!(log.lock().unwrap().starts, 0);
    }

    #[test]
    fn test_retire_during_start_terminates_fresh_driver() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let driver = MockDriver::gated(gate.clone());
        let log = driver.log.clone();
        let (session, _) = session_with(driver);

        let starting = Arc::clone(&session);
        let start = std::thread::spawn(move || starting.start());

        gate.wait();
        session.retire();
        gate.wait();

        assert!(matches!(
            start.join().unwrap(),
            Err(SessionError::InactiveSession(_))
        ));
        assert_eq!(session.state(), SessionState::Inactive);
        let log = log.lock().unwrap();
        assert_eq!(log.starts, 1);
        assert_eq!(log.terminations, 1);
    }

    #[test]
    fn test_retire_stops_active_session() {
        let driver = MockDriver::new();
        let log = driver.log.clone();
        let (session, _) = session_with(driver);
        session.start().unwrap();

        session.retire();
        session.retire();

        assert_eq!(session.state(), SessionState::Inactive);
        assert_eq!(log.lock().unwrap().terminations, 1);
    }

    #[test]
    fn test_failed_start_surfaces_error() {
        let driver = MockDriver::failing(|| {
            DriverError::AuthenticationFailed("Permission denied".to_string())
        });
        let (session, _) = session_with(driver);

        let result = session.start();
        assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn test_send_input_on_inactive_session_makes_no_driver_call() {
        let driver = MockDriver::new();
        let log = driver.log.clone();
        let (session, _) = session_with(driver);

        assert!(matches!(
            session.send_input("ls"),
            Err(SessionError::InactiveSession(_))
        ));

        session.start().unwrap();
        session.send_input("ls").unwrap();
        session.stop().unwrap();

        assert!(matches!(
            session.send_input("pwd"),
            Err(SessionError::InactiveSession(_))
        ));
        assert_eq!(log.lock().unwrap().sent, vec!["ls".to_string()]);
    }

    #[test]
    fn test_stop_terminates_driver() {
        let driver = MockDriver::new();
        let log = driver.log.clone();
        let (session, _) = session_with(driver);

        session.start().unwrap();
        session.stop().unwrap();

        assert_eq!(log.lock().unwrap().terminations, 1);
        assert!(session.stopped_at().is_some());
    }

    #[test]
    fn test_drain_once_filters_and_records() {
        let driver = MockDriver::new();
        driver.push_output(b"hi\r\n");
        let (session, _) = session_with(driver);
        session.start().unwrap();

        let chunk = session.drain_once(4096, Duration::from_millis(1)).unwrap();
        assert_eq!(chunk.as_deref(), Some("hi<br>"));
        assert_eq!(session.history().concat(), "hi<br>");

        assert_eq!(session.drain_once(4096, Duration::from_millis(1)).unwrap(), None);
    }

    #[test]
    fn test_drain_once_on_inactive_session() {
        let (session, _) = session_with(MockDriver::new());
        assert!(matches!(
            session.drain_once(4096, Duration::from_millis(1)),
            Err(SessionError::InactiveSession(_))
        ));
    }

    #[test]
    fn test_drain_once_reports_driver_failure() {
        let driver = MockDriver::new();
        driver
            .output
            .lock()
            .unwrap()
            .push_back(Err(std::io::ErrorKind::BrokenPipe));
        let (session, _) = session_with(driver);
        session.start().unwrap();

        assert!(matches!(
            session.drain_once(4096, Duration::from_millis(1)),
            Err(SessionError::DriverIo(_))
        ));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_split_utf8_sequence_is_carried() {
        let driver = MockDriver::new();
        let bytes = "é".as_bytes();
        driver.push_output(&bytes[..1]);
        driver.push_output(&bytes[1..]);
        let (session, _) = session_with(driver);
        session.start().unwrap();

        assert_eq!(session.drain_once(4096, Duration::from_millis(1)).unwrap(), None);
        assert_eq!(
            session.drain_once(4096, Duration::from_millis(1)).unwrap().as_deref(),
            Some("é")
        );
    }

    #[test]
    fn test_chunk_published_to_room() {
        let driver = MockDriver::new();
        driver.push_output(b"hello\n");
        let (session, broadcaster) = session_with(driver);
        let mut rx = broadcaster.join(&"x".to_string(), "observer".to_string());
        session.start().unwrap();

        session.drain_once(4096, Duration::from_millis(1)).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            RoomEvent::Output {
                session_id: "x".to_string(),
                chunk: "hello<br>".to_string(),
            }
        );
    }

    #[test]
    fn test_summary() {
        let (session, _) = session_with(MockDriver::new());
        let summary = session.summary();
        assert_eq!(summary.id, "x");
        assert_eq!(summary.state, SessionState::Created);
        assert_eq!(summary.driver, "mock");
        assert_eq!(summary.history_chunks, 0);
        assert!(!summary.output_closed);
    }

    #[tokio::test]
    async fn test_drain_loop_forwards_in_order_and_exits_on_stop() {
        let driver = MockDriver::new();
        let output = driver.output.clone();
        let (session, broadcaster) = session_with(driver);
        let mut rx = broadcaster.join(&"x".to_string(), "observer".to_string());

        session.start().unwrap();
        session.start_drain_loop(DrainSettings {
            chunk_size: 4096,
            read_timeout: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
        });
        assert!(session.is_draining());

        for i in 0..5 {
            output
                .lock()
                .unwrap()
                .push_back(Ok(format!("line-{}\n", i).into_bytes()));
        }

        let mut received = Vec::new();
        while received.len() < 5 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(RoomEvent::Output { chunk, .. })) => received.push(chunk),
                other => panic!("Expected output event, got {:?}", other),
            }
        }

        let expected: Vec<String> = (0..5).map(|i| format!("line-{}<br>", i)).collect();
        assert_eq!(received, expected);
        assert_eq!(session.history(), expected);

        session.stop().unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.join_drain_loop())
            .await
            .expect("drain loop did not exit after stop");
        assert!(!session.is_draining());
    }

    #[tokio::test]
    async fn test_drain_loop_exits_on_driver_failure_without_stopping() {
        let driver = MockDriver::new();
        driver
            .output
            .lock()
            .unwrap()
            .push_back(Err(std::io::ErrorKind::BrokenPipe));
        let (session, _) = session_with(driver);

        session.start().unwrap();
        session.start_drain_loop(DrainSettings::default());

        tokio::time::timeout(Duration::from_secs(2), session.join_drain_loop())
            .await
            .expect("drain loop did not exit after driver failure");

        assert_eq!(session.state(), SessionState::Active);
        assert!(session.output_closed());
    }

    #[tokio::test]
    async fn test_drain_loop_not_started_for_created_session() {
        let (session, _) = session_with(MockDriver::new());
        session.start_drain_loop(DrainSettings::default());
        assert!(!session.is_draining());
    }
}
