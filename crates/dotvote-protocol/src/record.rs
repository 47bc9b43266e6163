use std::collections::BTreeMap;
use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::view::{ItemTally, SessionSnapshot, SessionSummary};
use crate::{CreatorRole, ItemId, ParticipantId, SessionError, SessionId, SessionStatus};

const DEFAULT_BUDGET: NonZeroU32 = NonZeroU32::new(10).unwrap();

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteItem {
    pub id: ItemId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    /// Display label or email address supplied by the organizer.
    pub contact: String,
    #[serde(default)]
    pub has_voted: bool,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    pub anonymous: bool,
    pub votes_per_participant: NonZeroU32,
    #[serde(default)]
    pub show_results_live: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            anonymous: true,
            votes_per_participant: DEFAULT_BUDGET,
            show_results_live: false,
        }
    }
}

/// One voting session: metadata, items, participants, vote ledger, and
/// lifecycle status. All mutating methods enforce the lifecycle rules
/// (`draft -> active -> completed`, never reversed) and fail loudly instead
/// of silently ignoring a disallowed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<VoteItem>,
    /// Next item id to hand out. Item ids are never reused within a
    /// session, including after removal.
    #[serde(default = "first_item_id")]
    pub next_item_id: ItemId,
    #[serde(default)]
    pub participants: BTreeMap<ParticipantId, Participant>,
    #[serde(default)]
    pub votes: BTreeMap<ParticipantId, BTreeMap<ItemId, u32>>,
    pub settings: SessionSettings,
    pub creator_id: String,
    pub creator_role: CreatorRole,
}

fn first_item_id() -> ItemId {
    1
}

impl SessionRecord {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        creator_id: impl Into<String>,
        creator_role: CreatorRole,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            status: SessionStatus::Draft,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            items: Vec::new(),
            next_item_id: first_item_id(),
            participants: BTreeMap::new(),
            votes: BTreeMap::new(),
            settings,
            creator_id: creator_id.into(),
            creator_role,
        }
    }

    /// Ownership predicate consumed by the access-control layer: the
    /// creator may mutate their own session, administrators may mutate any.
    pub fn can_mutate(&self, actor_id: &str, actor_role: CreatorRole) -> bool {
        actor_role == CreatorRole::Administrator || self.creator_id == actor_id
    }

    fn ensure_status(
        &self,
        expected: SessionStatus,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        if self.status != expected {
            return Err(SessionError::InvalidStateTransition {
                status: self.status,
                operation,
            });
        }
        Ok(())
    }

    pub fn set_details(
        &mut self,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Draft, "update_details")?;
        if let Some(title) = title {
            self.title = title;
        }
        if let Some(description) = description {
            self.description = description;
        }
        Ok(())
    }

    pub fn set_settings(&mut self, settings: SessionSettings) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Draft, "update_settings")?;
        self.settings = settings;
        Ok(())
    }

    pub fn add_item(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<ItemId, SessionError> {
        self.ensure_status(SessionStatus::Draft, "add_item")?;
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.items.push(VoteItem {
            id,
            name: name.into(),
            description: description.into(),
        });
        Ok(id)
    }

    pub fn remove_item(&mut self, item_id: ItemId) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Draft, "remove_item")?;
        let before = self.items.len();
        self.items.retain(|item| item.id != item_id);
        if self.items.len() == before {
            return Err(SessionError::UnknownItem(item_id));
        }
        Ok(())
    }

    pub fn add_participant(
        &mut self,
        contact: impl Into<String>,
    ) -> Result<ParticipantId, SessionError> {
        self.ensure_status(SessionStatus::Draft, "add_participant")?;
        let id = uuid::Uuid::new_v4().to_string();
        self.participants.insert(
            id.clone(),
            Participant {
                contact: contact.into(),
                has_voted: false,
                added_at: Utc::now(),
                voted_at: None,
            },
        );
        Ok(id)
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Draft, "remove_participant")?;
        if self.participants.remove(participant_id).is_none() {
            return Err(SessionError::UnknownParticipant(participant_id.to_string()));
        }
        self.votes.remove(participant_id);
        Ok(())
    }

    /// `draft -> active`. Requires at least one item.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Draft, "start")?;
        if self.items.is_empty() {
            return Err(SessionError::InvalidStateTransition {
                status: self.status,
                operation: "start",
            });
        }
        self.status = SessionStatus::Active;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `active -> completed`. No vote mutation is accepted afterwards.
    pub fn complete(&mut self) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Active, "complete")?;
        self.status = SessionStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Sole mutating entry point into the vote ledger. Validates the whole
    /// allocation, then replaces the participant's prior allocation in one
    /// step; resubmission is overwrite, never accumulation. Items omitted
    /// from the allocation count as zero, and zero-valued entries are
    /// dropped so `has_voted` stays equivalent to "has a non-empty
    /// allocation".
    pub fn submit_votes(
        &mut self,
        participant_id: &str,
        allocation: &BTreeMap<ItemId, i64>,
    ) -> Result<(), SessionError> {
        self.ensure_status(SessionStatus::Active, "submit_votes")?;
        if !self.participants.contains_key(participant_id) {
            return Err(SessionError::UnknownParticipant(participant_id.to_string()));
        }
        let mut allocated: u64 = 0;
        for (&item, &value) in allocation {
            if !self.items.iter().any(|i| i.id == item) {
                return Err(SessionError::UnknownItem(item));
            }
            if value < 0 {
                return Err(SessionError::NegativeAllocation { item });
            }
            allocated = allocated.saturating_add(value as u64);
        }
        let budget = self.settings.votes_per_participant.get();
        if allocated > u64::from(budget) {
            return Err(SessionError::BudgetExceeded { allocated, budget });
        }
        let normalized: BTreeMap<ItemId, u32> = allocation
            .iter()
            .filter(|(_, &value)| value > 0)
            .map(|(&item, &value)| (item, value as u32))
            .collect();
        let participant = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| SessionError::UnknownParticipant(participant_id.to_string()))?;
        if normalized.is_empty() {
            self.votes.remove(participant_id);
            participant.has_voted = false;
            participant.voted_at = None;
        } else {
            self.votes.insert(participant_id.to_string(), normalized);
            participant.has_voted = true;
            participant.voted_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Aggregate tallies, recomputed by summing current allocations. Never
    /// cached and never accumulated incrementally, so retried or replaced
    /// submissions cannot drift the totals.
    pub fn tallies(&self) -> BTreeMap<ItemId, u64> {
        let mut totals: BTreeMap<ItemId, u64> = self.items.iter().map(|i| (i.id, 0)).collect();
        for allocation in self.votes.values() {
            for (item, count) in allocation {
                if let Some(total) = totals.get_mut(item) {
                    *total += u64::from(*count);
                }
            }
        }
        totals
    }

    /// Tallies joined with item metadata, sorted by votes descending, with
    /// percentages of the grand total rounded to one decimal.
    pub fn results(&self) -> Vec<ItemTally> {
        let totals = self.tallies();
        let grand: u64 = totals.values().sum();
        let mut out: Vec<ItemTally> = self
            .items
            .iter()
            .map(|item| ItemTally {
                item_id: item.id,
                name: item.name.clone(),
                description: item.description.clone(),
                votes: totals.get(&item.id).copied().unwrap_or(0),
                percentage: 0.0,
            })
            .collect();
        if grand > 0 {
            for tally in &mut out {
                tally.percentage = (tally.votes as f64 / grand as f64 * 1000.0).round() / 10.0;
            }
        }
        out.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| a.item_id.cmp(&b.item_id)));
        out
    }

    pub fn voted_count(&self) -> usize {
        self.participants.values().filter(|p| p.has_voted).count()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let participant_count = self.participants.len();
        let voted_count = self.voted_count();
        let participation = if participant_count > 0 {
            (voted_count as f64 / participant_count as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        SessionSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            item_count: self.items.len(),
            participant_count,
            voted_count,
            participation,
            tallies: self.results(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            participants: self.participants.len(),
            items: self.items.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_session() -> SessionRecord {
        SessionRecord::new(
            "Team lunch",
            "Where should we go?",
            "organizer-1",
            CreatorRole::Owner,
            SessionSettings::default(),
        )
    }

    fn active_session() -> (SessionRecord, ParticipantId, ParticipantId) {
        let mut session = draft_session();
        session.add_item("Pizza", "").expect("add item");
        session.add_item("Tacos", "").expect("add item");
        let p1 = session.add_participant("p1@example.com").expect("add p1");
        let p2 = session.add_participant("p2@example.com").expect("add p2");
        session.start().expect("start");
        (session, p1, p2)
    }

    fn allocation(pairs: &[(ItemId, i64)]) -> BTreeMap<ItemId, i64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn fresh_session_is_draft_with_no_timestamps() {
        let session = draft_session();
        assert_eq!(session.status, SessionStatus::Draft);
        assert!(session.started_at.is_none());
        assert!(session.completed_at.is_none());
        assert!(session.items.is_empty());
    }

    #[test]
    fn item_ids_are_sequential_and_never_reused() {
        let mut session = draft_session();
        let first = session.add_item("Pizza", "").expect("add");
        let second = session.add_item("Tacos", "").expect("add");
        assert_eq!((first, second), (1, 2));
        session.remove_item(second).expect("remove");
        let third = session.add_item("Sushi", "").expect("add");
        assert_eq!(third, 3);
    }

    #[test]
    fn start_requires_at_least_one_item() {
        let mut session = draft_session();
        let err = session.start().expect_err("must refuse");
        assert!(matches!(
            err,
            SessionError::InvalidStateTransition {
                operation: "start",
                ..
            }
        ));
        assert_eq!(session.status, SessionStatus::Draft);
        assert!(session.started_at.is_none());
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let (mut session, _, _) = active_session();
        let err = session.start().expect_err("cannot start twice");
        assert!(matches!(
            err,
            SessionError::InvalidStateTransition { .. }
        ));
        session.complete().expect("complete");
        assert!(session.completed_at.is_some());
        let err = session.complete().expect_err("cannot complete twice");
        assert!(matches!(
            err,
            SessionError::InvalidStateTransition { .. }
        ));
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn structural_mutation_is_draft_only() {
        let (mut session, p1, _) = active_session();
        assert!(session.add_item("Late", "").is_err());
        assert!(session.add_participant("late@example.com").is_err());
        assert!(session.remove_participant(&p1).is_err());
        assert!(session.set_settings(SessionSettings::default()).is_err());
        assert!(session.set_details(Some("new".into()), None).is_err());
    }

    #[test]
    fn votes_are_rejected_outside_active() {
        let mut session = draft_session();
        session.add_item("Pizza", "").expect("add");
        let err = session
            .submit_votes("nobody", &allocation(&[(1, 1)]))
            .expect_err("draft rejects votes");
        assert!(matches!(
            err,
            SessionError::InvalidStateTransition {
                status: SessionStatus::Draft,
                operation: "submit_votes",
            }
        ));
    }

    #[test]
    fn submit_votes_validates_before_mutating() {
        let (mut session, p1, _) = active_session();

        let err = session
            .submit_votes("ghost", &allocation(&[(1, 1)]))
            .expect_err("unknown participant");
        assert!(matches!(err, SessionError::UnknownParticipant(_)));

        let err = session
            .submit_votes(&p1, &allocation(&[(99, 1)]))
            .expect_err("unknown item");
        assert!(matches!(err, SessionError::UnknownItem(99)));

        let err = session
            .submit_votes(&p1, &allocation(&[(1, -2)]))
            .expect_err("negative allocation");
        assert!(matches!(err, SessionError::NegativeAllocation { item: 1 }));

        let err = session
            .submit_votes(&p1, &allocation(&[(1, 11)]))
            .expect_err("budget exceeded");
        assert!(matches!(
            err,
            SessionError::BudgetExceeded {
                allocated: 11,
                budget: 10,
            }
        ));

        // None of the failures above may leave any trace.
        assert!(session.votes.is_empty());
        assert!(!session.participants[&p1].has_voted);
    }

    #[test]
    fn resubmission_replaces_instead_of_merging() {
        let (mut session, p1, _) = active_session();
        session
            .submit_votes(&p1, &allocation(&[(1, 7), (2, 3)]))
            .expect("first submission");
        session
            .submit_votes(&p1, &allocation(&[(2, 4)]))
            .expect("second submission");
        let tallies = session.tallies();
        assert_eq!(tallies[&1], 0);
        assert_eq!(tallies[&2], 4);
        assert!(session.participants[&p1].has_voted);
    }

    #[test]
    fn all_zero_resubmission_clears_has_voted() {
        let (mut session, p1, _) = active_session();
        session
            .submit_votes(&p1, &allocation(&[(1, 5)]))
            .expect("submit");
        assert!(session.participants[&p1].has_voted);
        session
            .submit_votes(&p1, &allocation(&[(1, 0)]))
            .expect("zero resubmission");
        assert!(!session.participants[&p1].has_voted);
        assert!(session.participants[&p1].voted_at.is_none());
        assert!(!session.votes.contains_key(&p1));
    }

    #[test]
    fn aggregate_matches_group_decision_scenario() {
        let (mut session, p1, p2) = active_session();
        session
            .submit_votes(&p1, &allocation(&[(1, 7), (2, 3)]))
            .expect("p1 votes");
        session
            .submit_votes(&p2, &allocation(&[(1, 2), (2, 8)]))
            .expect("p2 votes");
        let tallies = session.tallies();
        assert_eq!(tallies[&1], 9);
        assert_eq!(tallies[&2], 11);

        session.complete().expect("complete");
        let err = session
            .submit_votes(&p1, &allocation(&[(1, 1)]))
            .expect_err("completed session rejects votes");
        assert!(matches!(
            err,
            SessionError::InvalidStateTransition {
                status: SessionStatus::Completed,
                operation: "submit_votes",
            }
        ));
    }

    #[test]
    fn results_sort_by_votes_and_carry_percentages() {
        let (mut session, p1, p2) = active_session();
        session
            .submit_votes(&p1, &allocation(&[(1, 2), (2, 8)]))
            .expect("p1 votes");
        session
            .submit_votes(&p2, &allocation(&[(1, 1), (2, 9)]))
            .expect("p2 votes");
        let results = session.results();
        assert_eq!(results[0].item_id, 2);
        assert_eq!(results[0].votes, 17);
        assert_eq!(results[0].percentage, 85.0);
        assert_eq!(results[1].item_id, 1);
        assert_eq!(results[1].percentage, 15.0);
    }

    #[test]
    fn snapshot_reports_participation() {
        let (mut session, p1, _) = active_session();
        session
            .submit_votes(&p1, &allocation(&[(1, 1)]))
            .expect("vote");
        let snapshot = session.snapshot();
        assert_eq!(snapshot.participant_count, 2);
        assert_eq!(snapshot.voted_count, 1);
        assert_eq!(snapshot.participation, 50.0);
        assert_eq!(snapshot.item_count, 2);
    }

    #[test]
    fn ownership_predicate() {
        let session = draft_session();
        assert!(session.can_mutate("organizer-1", CreatorRole::Owner));
        assert!(!session.can_mutate("someone-else", CreatorRole::Owner));
        assert!(session.can_mutate("someone-else", CreatorRole::Administrator));
    }

    #[test]
    fn record_round_trips_through_json() {
        let (mut session, p1, _) = active_session();
        session
            .submit_votes(&p1, &allocation(&[(1, 4), (2, 6)]))
            .expect("vote");
        let encoded = serde_json::to_string(&session).expect("serialize");
        let decoded: SessionRecord = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded.id, session.id);
        assert_eq!(decoded.status, SessionStatus::Active);
        assert_eq!(decoded.tallies(), session.tallies());
        assert_eq!(decoded.next_item_id, session.next_item_id);
    }
}
