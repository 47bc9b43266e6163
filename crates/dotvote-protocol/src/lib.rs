//! Shared domain model for dotvote voting sessions.
//!
//! Everything that is persisted, published, or validated lives here so the
//! store, the broadcaster, and the session manager agree on one vocabulary.

mod event;
mod record;
mod view;

pub use event::*;
pub use record::*;
pub use view::*;

use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type ParticipantId = String;
pub type ItemId = u32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Draft,
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(SessionStatus::Draft),
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role the creating actor held when the session was created. Access policy
/// is enforced by the calling surface; the record only answers the
/// ownership predicate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreatorRole {
    Owner,
    Administrator,
}

impl CreatorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatorRole::Owner => "owner",
            CreatorRole::Administrator => "administrator",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session `{0}` not found")]
    SessionNotFound(SessionId),
    #[error("operation `{operation}` is not valid for a {status} session")]
    InvalidStateTransition {
        status: SessionStatus,
        operation: &'static str,
    },
    #[error("participant `{0}` is not part of this session")]
    UnknownParticipant(ParticipantId),
    #[error("item {0} does not exist in this session")]
    UnknownItem(ItemId),
    #[error("negative allocation for item {item}")]
    NegativeAllocation { item: ItemId },
    #[error("allocation of {allocated} points exceeds the budget of {budget}")]
    BudgetExceeded { allocated: u64, budget: u32 },
    #[error("invalid voting token")]
    InvalidToken,
    #[error("timed out waiting for the session to become available")]
    OperationTimedOut,
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_match_snake_case() {
        assert_eq!(SessionStatus::Draft.as_str(), "draft");
        assert_eq!(SessionStatus::Active.as_str(), "active");
        assert_eq!(SessionStatus::Completed.as_str(), "completed");
    }

    #[test]
    fn status_from_slug_is_case_insensitive() {
        assert_eq!(
            SessionStatus::from_slug(" Active "),
            Some(SessionStatus::Active)
        );
        assert_eq!(
            SessionStatus::from_slug("COMPLETED"),
            Some(SessionStatus::Completed)
        );
        assert_eq!(SessionStatus::from_slug("archived"), None);
    }

    #[test]
    fn errors_name_status_and_operation() {
        let err = SessionError::InvalidStateTransition {
            status: SessionStatus::Completed,
            operation: "submit_votes",
        };
        let msg = err.to_string();
        assert!(msg.contains("submit_votes"));
        assert!(msg.contains("completed"));
    }
}
