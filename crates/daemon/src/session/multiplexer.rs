//! Room-based output fan-out.
//!
//! Every session has a room named after its id. Observers join a room and get
//! a bounded channel of [`RoomEvent`]s. Slow observers never hold up a
//! session: a client whose buffer is full is removed from the room. Its
//! receiver yields what was already queued and then ends, so an observer's
//! stream is always a gap-free prefix of the session's output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::interactive::{Session, SessionId};

/// Unique identifier for an observer within a room.
pub type ClientId = String;

/// Default channel capacity for client output.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Something a room delivers to its observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoomEvent {
    /// One filtered chunk, in drain order.
    Output { session_id: SessionId, chunk: String },
    /// Everything recorded before the observer joined.
    History {
        session_id: SessionId,
        chunks: Vec<String>,
    },
    /// The session was terminated; no more events follow.
    Closed { session_id: SessionId },
    /// The observer was removed from the room while the session lives on,
    /// because it fell behind or another observer took its id. No more
    /// events follow.
    Dropped { session_id: SessionId },
}

/// The sink a session publishes its output to.
///
/// Methods never block: they are called while the session holds its
/// history lock.
pub trait Broadcaster: Send + Sync {
    /// Delivers one chunk to every observer of `session_id`.
    fn publish(&self, session_id: &SessionId, chunk: &str);

    /// Delivers the full history to observers that have not had a replay yet.
    fn publish_history(&self, session_id: &SessionId, history: &[String]);

    /// Tells observers the session is gone and forgets the room.
    fn close_room(&self, session_id: &SessionId);
}

/// A broadcaster that publishes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn publish(&self, _session_id: &SessionId, _chunk: &str) {}

    fn publish_history(&self, _session_id: &SessionId, _history: &[String]) {}

    fn close_room(&self, _session_id: &SessionId) {}
}

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total events delivered.
    pub messages_sent: u64,
    /// Events that did not fit in the client's buffer.
    pub messages_dropped: u64,
    /// Set once a delivery found the buffer full; the client is then
    /// removed from its room.
    pub is_backpressured: bool,
}

/// An observer's end of a room.
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<RoomEvent>,
    stats: ClientStats,
    history_delivered: bool,
}

impl ClientHandle {
    /// Creates a handle and the receiver the observer reads from.
    pub fn new(id: ClientId) -> (Self, mpsc::Receiver<RoomEvent>) {
        Self::with_capacity(id, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<RoomEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            stats: ClientStats::default(),
            history_delivered: false,
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub fn is_backpressured(&self) -> bool {
        self.stats.is_backpressured
    }

    /// Non-blocking delivery. Returns true if the event was queued.
    fn try_send(&mut self, event: RoomEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                self.stats.is_backpressured = true;
                tracing::warn!(
                    client_id = %self.id,
                    sent = self.stats.messages_sent,
                    "Client buffer full, removing it from the room"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %self.id, "Client channel closed");
                false
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Fans session output out to rooms of observers.
pub struct RoomBroadcaster {
    rooms: DashMap<SessionId, HashMap<ClientId, ClientHandle>>,
    channel_capacity: usize,
    /// Unix epoch milliseconds of the last publish.
    last_activity: AtomicU64,
}

impl RoomBroadcaster {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster whose observers buffer at most `capacity` events.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            channel_capacity: capacity,
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    /// Adds `client_id` to the room of `session_id`, replacing any previous
    /// observer with the same id.
    pub fn join(&self, session_id: &SessionId, client_id: ClientId) -> mpsc::Receiver<RoomEvent> {
        let (handle, rx) = ClientHandle::with_capacity(client_id.clone(), self.channel_capacity);
        self.rooms
            .entry(session_id.clone())
            .or_default()
            .insert(client_id.clone(), handle);
        tracing::debug!(session_id = %session_id, client_id = %client_id, "Observer joined room");
        rx
    }

    /// Joins the room of `session` and queues its history as the first event.
    ///
    /// Runs under the session's history lock, so the observer sees the
    /// recorded prefix followed by live output with nothing missed or
    /// repeated in between.
    pub fn observe(&self, session: &Session, client_id: ClientId) -> mpsc::Receiver<RoomEvent> {
        session.with_history(|history| {
            let rx = self.join(session.id(), client_id);
            self.publish_history(session.id(), history);
            rx
        })
    }

    /// Removes an observer. Empty rooms are forgotten.
    pub fn leave(&self, session_id: &SessionId, client_id: &ClientId) -> Option<ClientStats> {
        let stats = self
            .rooms
            .get_mut(session_id)
            .and_then(|mut room| room.remove(client_id))
            .map(|handle| handle.stats());

        self.rooms.remove_if(session_id, |_, room| room.is_empty());

        if stats.is_some() {
            tracing::debug!(session_id = %session_id, client_id = %client_id, "Observer left room");
        }
        stats
    }

    /// Number of observers in a room.
    pub fn room_size(&self, session_id: &SessionId) -> usize {
        self.rooms.get(session_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Ids of all rooms with at least one observer.
    pub fn rooms(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn client_stats(&self, session_id: &SessionId, client_id: &ClientId) -> Option<ClientStats> {
        self.rooms
            .get(session_id)
            .and_then(|room| room.get(client_id).map(ClientHandle::stats))
    }

    /// Unix epoch milliseconds of the last publish.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Sends `event` to every client in the room selected by `wants`,
    /// pruning clients whose receiver is gone or whose buffer overflowed.
    /// Returns the number reached.
    fn fan_out(
        &self,
        session_id: &SessionId,
        event: RoomEvent,
        mut wants: impl FnMut(&mut ClientHandle) -> bool,
    ) -> usize {
        let Some(mut room) = self.rooms.get_mut(session_id) else {
            return 0;
        };

        let mut disconnected = Vec::new();
        let mut lagging = Vec::new();
        let mut delivered = 0;

        for (client_id, handle) in room.iter_mut() {
            if handle.is_closed() {
                disconnected.push(client_id.clone());
                continue;
            }
            if !wants(handle) {
                continue;
            }
            if handle.try_send(event.clone()) {
                delivered += 1;
            } else if handle.is_backpressured() {
                lagging.push(client_id.clone());
            }
        }

        for client_id in disconnected {
            room.remove(&client_id);
            tracing::debug!(session_id = %session_id, client_id = %client_id, "Removed disconnected observer");
        }
        for client_id in lagging {
            room.remove(&client_id);
            tracing::info!(session_id = %session_id, client_id = %client_id, "Removed lagging observer");
        }

        let empty = room.is_empty();
        drop(room);
        if empty {
            self.rooms.remove_if(session_id, |_, room| room.is_empty());
        }

        delivered
    }
}

impl Default for RoomBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for RoomBroadcaster {
    fn publish(&self, session_id: &SessionId, chunk: &str) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);

        let event = RoomEvent::Output {
            session_id: session_id.clone(),
            chunk: chunk.to_string(),
        };
        let delivered = self.fan_out(session_id, event, |_| true);
        tracing::trace!(session_id = %session_id, delivered, "Published chunk");
    }

    fn publish_history(&self, session_id: &SessionId, history: &[String]) {
        let event = RoomEvent::History {
            session_id: session_id.clone(),
            chunks: history.to_vec(),
        };
        // Only clients that joined since the last replay want one.
        self.fan_out(session_id, event, |handle| {
            !std::mem::replace(&mut handle.history_delivered, true)
        });
    }

    fn close_room(&self, session_id: &SessionId) {
        if let Some((_, mut room)) = self.rooms.remove(session_id) {
            let event = RoomEvent::Closed {
                session_id: session_id.clone(),
            };
            for handle in room.values_mut() {
                handle.try_send(event.clone());
            }
            tracing::debug!(session_id = %session_id, observers = room.len(), "Closed room");
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
