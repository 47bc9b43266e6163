use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::view::SessionSnapshot;
use crate::{ParticipantId, SessionId, SessionStatus};

// Broadcast topic names, dot.case.
pub const TOPIC_STATUS_CHANGED: &str = "session.status.changed";
pub const TOPIC_TALLY_UPDATED: &str = "session.tally.updated";
pub const TOPIC_PARTICIPANT_JOINED: &str = "session.participant.joined";
pub const TOPIC_PARTICIPANT_LEFT: &str = "session.participant.left";
pub const TOPIC_SESSION_UPDATED: &str = "session.updated";
pub const TOPIC_SESSION_DELETED: &str = "session.deleted";

/// State-change notifications published to a session's room. Payloads are
/// derived views; a subscriber can never reconstruct another participant's
/// individual allocation from them. When a session is anonymous the voter
/// identity is withheld here, at the publish boundary, not by clients.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },
    TallyUpdated {
        session_id: SessionId,
        snapshot: SessionSnapshot,
        /// Voter identity; `None` for anonymous sessions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<ParticipantId>,
    },
    ParticipantJoined {
        session_id: SessionId,
        participant_count: usize,
    },
    ParticipantLeft {
        session_id: SessionId,
        participant_count: usize,
    },
    /// Draft-time edit to details, settings or items.
    SessionUpdated {
        session_id: SessionId,
    },
    SessionDeleted {
        session_id: SessionId,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::StatusChanged { .. } => TOPIC_STATUS_CHANGED,
            SessionEvent::TallyUpdated { .. } => TOPIC_TALLY_UPDATED,
            SessionEvent::ParticipantJoined { .. } => TOPIC_PARTICIPANT_JOINED,
            SessionEvent::ParticipantLeft { .. } => TOPIC_PARTICIPANT_LEFT,
            SessionEvent::SessionUpdated { .. } => TOPIC_SESSION_UPDATED,
            SessionEvent::SessionDeleted { .. } => TOPIC_SESSION_DELETED,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StatusChanged { session_id, .. }
            | SessionEvent::TallyUpdated { session_id, .. }
            | SessionEvent::ParticipantJoined { session_id, .. }
            | SessionEvent::ParticipantLeft { session_id, .. }
            | SessionEvent::SessionUpdated { session_id }
            | SessionEvent::SessionDeleted { session_id } => session_id,
        }
    }
}
