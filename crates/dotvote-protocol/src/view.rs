use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ItemId, SessionId, SessionStatus};

/// Aggregated votes for one item, joined with its metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ItemTally {
    pub item_id: ItemId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub votes: u64,
    pub percentage: f64,
}

/// Read-only view handed to dashboards, presentation screens and the
/// export layer. Carries aggregates only; individual allocations never
/// leave the record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub title: String,
    pub status: SessionStatus,
    pub item_count: usize,
    pub participant_count: usize,
    pub voted_count: usize,
    /// Share of participants who have voted, 0-100 with one decimal.
    pub participation: f64,
    pub tallies: Vec<ItemTally>,
}

/// Denormalized index entry kept alongside the on-disk partitions so
/// listing does not have to load every record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participants: usize,
    #[serde(default)]
    pub items: usize,
}
