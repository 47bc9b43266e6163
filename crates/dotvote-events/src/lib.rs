//! Live-update fan-out, one broadcast room per session.
//!
//! Dashboards, presentation screens and voting clients subscribe to a
//! session's room and receive derived-view events as they happen. Rooms are
//! isolated: an event published for one session is never delivered to
//! another session's subscribers. Publishing is fire-and-forget; a slow or
//! disconnected subscriber can lag (the bounded channel drops its oldest
//! events) but can never block the publisher or its peers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use dotvote_protocol::{SessionEvent, SessionId};

/// Event envelope (RFC3339 time, dot.case kind).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub event: SessionEvent,
}

/// A broadcast bus keyed by session id.
#[derive(Clone)]
pub struct RoomBus {
    rooms: Arc<RwLock<HashMap<SessionId, broadcast::Sender<Envelope>>>>,
    capacity: usize,
}

impl RoomBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to a session's room, creating the room on first use.
    /// Subscribing twice just hands out two independent receivers; dropping
    /// a receiver is the unsubscribe.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Envelope> {
        if let Some(tx) = self
            .rooms
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
        {
            return tx.subscribe();
        }
        let mut rooms = self
            .rooms
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rooms
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Delivers an event to every current subscriber of the session's room
    /// and to nobody else. A room with no subscribers is a no-op.
    pub fn publish(&self, session_id: &str, event: &SessionEvent) {
        let tx = {
            let rooms = self
                .rooms
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match rooms.get(session_id) {
                Some(tx) => tx.clone(),
                None => return,
            }
        };
        let envelope = Envelope {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: event.kind().to_string(),
            event: event.clone(),
        };
        if tx.send(envelope).is_err() {
            tracing::debug!(session_id, "no live subscribers for event");
        }
    }

    /// Tears a room down, typically when its session is deleted. Existing
    /// receivers observe channel closure; calling this for an unknown room
    /// is a no-op.
    pub fn close_room(&self, session_id: &str) {
        self.rooms
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
    }

    pub fn room_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
