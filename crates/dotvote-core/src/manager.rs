use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use dotvote_events::RoomBus;
use dotvote_link::{peek_session_id, LinkCodec, LinkKey};
use dotvote_protocol::{
    CreatorRole, ItemId, ItemTally, ParticipantId, SessionError, SessionEvent, SessionId,
    SessionRecord, SessionSettings, SessionSnapshot, SessionStatus, SessionSummary,
};
use dotvote_store::{Partition, SessionStore};

use crate::config::EngineConfig;

static DEFAULT_LOCK_TIMEOUT_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("DOTVOTE_LOCK_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value >= 10)
        .unwrap_or(5_000)
});

static DEFAULT_BUS_CAPACITY: Lazy<usize> = Lazy::new(|| {
    std::env::var("DOTVOTE_BUS_CAPACITY")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value >= 1)
        .unwrap_or(256)
});

const DEFAULT_LIST_LIMIT: usize = 100;

/// Resolves the storage root: `DOTVOTE_STATE_DIR` wins over the config
/// file, which wins over the built-in default.
pub fn state_dir(cfg: &EngineConfig) -> PathBuf {
    if let Ok(dir) = std::env::var("DOTVOTE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    cfg.storage
        .root
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("state/sessions"))
}

#[derive(Clone)]
pub struct ManagerOptions {
    /// Bound on waiting for a session's serialization token.
    pub lock_timeout: Duration,
    /// Per-room broadcast buffer.
    pub bus_capacity: usize,
    /// Default cap for index listings.
    pub list_limit: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(*DEFAULT_LOCK_TIMEOUT_MS),
            bus_capacity: *DEFAULT_BUS_CAPACITY,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: cfg
                .engine
                .lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            bus_capacity: cfg.engine.bus_capacity.unwrap_or(defaults.bus_capacity),
            list_limit: cfg.engine.list_limit.unwrap_or(defaults.list_limit),
        }
    }
}

/// Parameters for [`SessionManager::create`].
#[derive(Clone, Debug)]
pub struct NewSession {
    pub title: String,
    pub description: String,
    pub creator_id: String,
    pub creator_role: CreatorRole,
    pub settings: SessionSettings,
}

enum Persist {
    Save,
    Relocate,
}

/// Owns the live session cache and serializes every mutation per session.
///
/// Constructed explicitly at startup and passed to collaborators; there is
/// no ambient singleton. Mutations against different sessions run fully in
/// parallel. Within one session the discipline is: acquire the session's
/// token (bounded wait), apply the operation to a clone of the cached
/// record, persist, then atomically swap the cache entry and publish the
/// change event. A persistence failure leaves the cache at the last
/// durable value, so callers never observe a partially applied mutation.
pub struct SessionManager {
    store: SessionStore,
    bus: RoomBus,
    options: ManagerOptions,
    cache: RwLock<HashMap<SessionId, Arc<SessionRecord>>>,
    /// Per-session serialization tokens, created lazily under a sync lock
    /// so "create the token" cannot race "use the token". Entries live as
    /// long as the session does.
    locks: StdMutex<HashMap<SessionId, Arc<Mutex<()>>>>,
    keys: RwLock<HashMap<SessionId, LinkKey>>,
}

impl SessionManager {
    pub async fn open(
        root: impl Into<PathBuf>,
        options: ManagerOptions,
    ) -> Result<Self, SessionError> {
        let store = SessionStore::open(root).await?;
        Ok(Self {
            bus: RoomBus::new(options.bus_capacity),
            cache: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            store,
            options,
        })
    }

    pub async fn with_config(cfg: &EngineConfig) -> Result<Self, SessionError> {
        Self::open(state_dir(cfg), ManagerOptions::from_config(cfg)).await
    }

    /// Live-update bus; hand this to anything that wants to subscribe.
    pub fn bus(&self) -> &RoomBus {
        &self.bus
    }

    pub fn store_root(&self) -> &Path {
        self.store.root()
    }

    pub async fn create(&self, req: NewSession) -> Result<Arc<SessionRecord>, SessionError> {
        let record = SessionRecord::new(
            req.title,
            req.description,
            req.creator_id,
            req.creator_role,
            req.settings,
        );
        self.install(record).await
    }

    /// New `draft` copying title, items and settings from an existing
    /// session, with a fresh id and key and nobody invited yet. Reads the
    /// source without taking its token.
    pub async fn duplicate(&self, session_id: &str) -> Result<Arc<SessionRecord>, SessionError> {
        let source = self.get(session_id).await?;
        let mut copy = SessionRecord::new(
            source.title.clone(),
            source.description.clone(),
            source.creator_id.clone(),
            source.creator_role,
            source.settings,
        );
        copy.items = source.items.clone();
        copy.next_item_id = source.next_item_id;
        self.install(copy).await
    }

    async fn install(&self, record: SessionRecord) -> Result<Arc<SessionRecord>, SessionError> {
        let key = LinkKey::generate();
        self.store.save(&record).await?;
        if let Err(err) = self.store.save_key(&record, &key).await {
            // A record without its key could never mint links; undo it.
            let _ = self.store.delete(&record.id).await;
            return Err(err);
        }
        let record = Arc::new(record);
        self.cache
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        self.keys.write().await.insert(record.id.clone(), key);
        info!(session_id = %record.id, title = %record.title, "session created");
        Ok(record)
    }

    /// Cached record, falling back to disk for sessions created by an
    /// earlier process.
    pub async fn get(&self, session_id: &str) -> Result<Arc<SessionRecord>, SessionError> {
        if let Some(record) = self.cache.read().await.get(session_id) {
            return Ok(record.clone());
        }
        let record = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let record = Arc::new(record);
        self.cache
            .write()
            .await
            .insert(session_id.to_string(), record.clone());
        Ok(record)
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        Ok(self.get(session_id).await?.snapshot())
    }

    pub async fn results(&self, session_id: &str) -> Result<Vec<ItemTally>, SessionError> {
        Ok(self.get(session_id).await?.results())
    }

    /// Index-backed listing; never loads full records.
    pub async fn list_active(&self) -> Result<Vec<SessionSummary>, SessionError> {
        self.store
            .list(Partition::Active, self.options.list_limit)
            .await
    }

    pub async fn list_completed(&self) -> Result<Vec<SessionSummary>, SessionError> {
        self.store
            .list(Partition::Completed, self.options.list_limit)
            .await
    }

    pub async fn update_details(
        &self,
        session_id: &str,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<Arc<SessionRecord>, SessionError> {
        let (_, updated) = self
            .with_session(session_id, Persist::Save, |session| {
                session.set_details(title, description)
            })
            .await?;
        self.publish_updated(session_id);
        Ok(updated)
    }

    pub async fn update_settings(
        &self,
        session_id: &str,
        settings: SessionSettings,
    ) -> Result<Arc<SessionRecord>, SessionError> {
        let (_, updated) = self
            .with_session(session_id, Persist::Save, |session| {
                session.set_settings(settings)
            })
            .await?;
        self.publish_updated(session_id);
        Ok(updated)
    }

    pub async fn add_item(
        &self,
        session_id: &str,
        name: String,
        description: String,
    ) -> Result<ItemId, SessionError> {
        let (item_id, _) = self
            .with_session(session_id, Persist::Save, |session| {
                session.add_item(name, description)
            })
            .await?;
        self.publish_updated(session_id);
        Ok(item_id)
    }

    pub async fn remove_item(
        &self,
        session_id: &str,
        item_id: ItemId,
    ) -> Result<(), SessionError> {
        let (_, _) = self
            .with_session(session_id, Persist::Save, |session| {
                session.remove_item(item_id)
            })
            .await?;
        self.publish_updated(session_id);
        Ok(())
    }

    pub async fn add_participant(
        &self,
        session_id: &str,
        contact: String,
    ) -> Result<ParticipantId, SessionError> {
        let (participant_id, updated) = self
            .with_session(session_id, Persist::Save, |session| {
                session.add_participant(contact)
            })
            .await?;
        self.bus.publish(
            session_id,
            &SessionEvent::ParticipantJoined {
                session_id: session_id.to_string(),
                participant_count: updated.participants.len(),
            },
        );
        Ok(participant_id)
    }

    pub async fn remove_participant(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<(), SessionError> {
        let (_, updated) = self
            .with_session(session_id, Persist::Save, |session| {
                session.remove_participant(participant_id)
            })
            .await?;
        self.bus.publish(
            session_id,
            &SessionEvent::ParticipantLeft {
                session_id: session_id.to_string(),
                participant_count: updated.participants.len(),
            },
        );
        Ok(())
    }

    pub async fn start(&self, session_id: &str) -> Result<Arc<SessionRecord>, SessionError> {
        let (_, updated) = self
            .with_session(session_id, Persist::Save, |session| session.start())
            .await?;
        self.bus.publish(
            session_id,
            &SessionEvent::StatusChanged {
                session_id: session_id.to_string(),
                from: SessionStatus::Draft,
                to: SessionStatus::Active,
                completed_at: None,
            },
        );
        info!(session_id, "session started");
        Ok(updated)
    }

    /// `active -> completed`, including the physical move into the
    /// completed partition as one logical operation.
    pub async fn complete(&self, session_id: &str) -> Result<Arc<SessionRecord>, SessionError> {
        let (_, updated) = self
            .with_session(session_id, Persist::Relocate, |session| session.complete())
            .await?;
        self.bus.publish(
            session_id,
            &SessionEvent::StatusChanged {
                session_id: session_id.to_string(),
                from: SessionStatus::Active,
                to: SessionStatus::Completed,
                completed_at: updated.completed_at,
            },
        );
        info!(session_id, "session completed");
        Ok(updated)
    }

    pub async fn submit_votes(
        &self,
        session_id: &str,
        participant_id: &str,
        allocation: &BTreeMap<ItemId, i64>,
    ) -> Result<Arc<SessionRecord>, SessionError> {
        let (_, updated) = self
            .with_session(session_id, Persist::Save, |session| {
                session.submit_votes(participant_id, allocation)
            })
            .await?;
        // Anonymity is enforced here, at the publish boundary: subscribers
        // of an anonymous session never learn who voted.
        let voter = (!updated.settings.anonymous).then(|| participant_id.to_string());
        self.bus.publish(
            session_id,
            &SessionEvent::TallyUpdated {
                session_id: session_id.to_string(),
                snapshot: updated.snapshot(),
                participant_id: voter,
            },
        );
        debug!(session_id, "votes recorded");
        Ok(updated)
    }

    /// Terminal removal: record, key, index entries, cache, lock and room.
    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let lock = self.session_lock(session_id);
        let _guard = tokio::time::timeout(self.options.lock_timeout, lock.lock())
            .await
            .map_err(|_| SessionError::OperationTimedOut)?;
        let _ = self.get(session_id).await?;
        self.store.delete(session_id).await?;
        self.cache.write().await.remove(session_id);
        self.keys.write().await.remove(session_id);
        self.bus.publish(
            session_id,
            &SessionEvent::SessionDeleted {
                session_id: session_id.to_string(),
            },
        );
        self.bus.close_room(session_id);
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Mints the opaque voting link token for one invited participant.
    pub async fn participant_link(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<String, SessionError> {
        let record = self.get(session_id).await?;
        if !record.participants.contains_key(participant_id) {
            return Err(SessionError::UnknownParticipant(participant_id.to_string()));
        }
        let key = self.key_for(&record).await?;
        LinkCodec::new(&key).encode(&record.id, participant_id)
    }

    /// Resolves an inbound voting link to a verified
    /// `(session_id, participant_id)` pair. Every failure (unknown
    /// session, missing key, failed authentication, unknown participant)
    /// surfaces as the same `InvalidToken`, so probing this endpoint leaks
    /// nothing a forger can use.
    pub async fn resolve_token(
        &self,
        token: &str,
    ) -> Result<(SessionId, ParticipantId), SessionError> {
        let hint = peek_session_id(token)?;
        let record = self
            .get(&hint)
            .await
            .map_err(|_| SessionError::InvalidToken)?;
        let key = self
            .key_for(&record)
            .await
            .map_err(|_| SessionError::InvalidToken)?;
        let claims = LinkCodec::new(&key).decode(token)?;
        if !record.participants.contains_key(&claims.participant_id) {
            return Err(SessionError::InvalidToken);
        }
        Ok((claims.session_id, claims.participant_id))
    }

    fn publish_updated(&self, session_id: &str) {
        self.bus.publish(
            session_id,
            &SessionEvent::SessionUpdated {
                session_id: session_id.to_string(),
            },
        );
    }

    async fn key_for(&self, record: &SessionRecord) -> Result<LinkKey, SessionError> {
        if let Some(key) = self.keys.read().await.get(&record.id) {
            return Ok(key.clone());
        }
        let key = self.store.load_key(record).await?;
        self.keys
            .write()
            .await
            .insert(record.id.clone(), key.clone());
        Ok(key)
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn with_session<T, F>(
        &self,
        session_id: &str,
        persist: Persist,
        apply: F,
    ) -> Result<(T, Arc<SessionRecord>), SessionError>
    where
        F: FnOnce(&mut SessionRecord) -> Result<T, SessionError>,
    {
        let lock = self.session_lock(session_id);
        let _guard = tokio::time::timeout(self.options.lock_timeout, lock.lock())
            .await
            .map_err(|_| SessionError::OperationTimedOut)?;
        let current = self.get(session_id).await?;
        let mut work = (*current).clone();
        let value = apply(&mut work)?;
        match persist {
            Persist::Save => self.store.save(&work).await?,
            Persist::Relocate => self.store.relocate_to_completed(&work).await?,
        }
        let updated = Arc::new(work);
        self.cache
            .write()
            .await
            .insert(session_id.to_string(), updated.clone());
        Ok((value, updated))
    }
}
