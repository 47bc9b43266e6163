//! Durable, date-partitioned session persistence.
//!
//! Each session is one self-describing JSON record plus one key file,
//! located under `<root>/<partition>/<YYYY-MM-DD>/`. Draft and active
//! sessions live in the `active` partition, completed ones in `completed`.
//! Two index files (one per partition) summarize the records so listings
//! never have to load every session.
//!
//! Writes are atomic from any reader's perspective: bytes go to a `.tmp`
//! sibling first and are renamed into place. There is no multi-file
//! transaction, so the ordering is record first, index second; the record
//! is authoritative whenever the two disagree, stale index entries are
//! filtered on read, and [`SessionStore::open`] reconciles both partitions
//! after a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs as afs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dotvote_link::LinkKey;
use dotvote_protocol::{SessionError, SessionRecord, SessionStatus, SessionSummary};

const INDEX_FILE: &str = "index.json";
const RECORD_EXT: &str = "json";
const KEY_EXT: &str = "key";

/// On-disk status partition. Draft sessions stay in `active` until they
/// complete; the partition split is what keeps directory sizes bounded and
/// completed history out of the hot path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    Active,
    Completed,
}

impl Partition {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Partition::Active => "active",
            Partition::Completed => "completed",
        }
    }

    pub fn for_status(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Completed => Partition::Completed,
            _ => Partition::Active,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    sessions: Vec<SessionSummary>,
}

pub struct SessionStore {
    root: PathBuf,
    /// The two index files are shared by every session; their
    /// read-modify-write cycles are serialized here because the manager
    /// only serializes per session.
    index_lock: Mutex<()>,
}

impl SessionStore {
    /// Opens (creating if needed) a store root and reconciles indexes with
    /// the records actually on disk.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let store = Self {
            root: root.into(),
            index_lock: Mutex::new(()),
        };
        for partition in [Partition::Active, Partition::Completed] {
            afs::create_dir_all(store.partition_dir(partition)).await?;
        }
        store.reconcile().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.root.join(partition.dir_name())
    }

    fn index_path(&self, partition: Partition) -> PathBuf {
        self.partition_dir(partition).join(INDEX_FILE)
    }

    fn date_dir(&self, partition: Partition, created_at: DateTime<Utc>) -> PathBuf {
        self.partition_dir(partition)
            .join(created_at.format("%Y-%m-%d").to_string())
    }

    fn record_path(&self, partition: Partition, record: &SessionRecord) -> PathBuf {
        self.date_dir(partition, record.created_at)
            .join(format!("{}.{}", record.id, RECORD_EXT))
    }

    fn key_path(&self, partition: Partition, record: &SessionRecord) -> PathBuf {
        self.date_dir(partition, record.created_at)
            .join(format!("{}.{}", record.id, KEY_EXT))
    }

    /// Persists a record into the partition matching its status, then
    /// updates that partition's index. Relocation between partitions goes
    /// through [`SessionStore::relocate_to_completed`] instead.
    pub async fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let partition = Partition::for_status(record.status);
        let path = self.record_path(partition, record);
        let bytes = serde_json::to_vec_pretty(record)?;
        save_bytes_atomic(&path, &bytes).await?;
        self.upsert_index(partition, record.summary()).await?;
        debug!(session_id = %record.id, path = %path.display(), "session record saved");
        Ok(())
    }

    /// Writes the session's link key beside its record. The key is never
    /// part of the record's serialized form.
    pub async fn save_key(&self, record: &SessionRecord, key: &LinkKey) -> Result<(), SessionError> {
        let partition = Partition::for_status(record.status);
        let path = self.key_path(partition, record);
        save_bytes_atomic(&path, key.to_base64().as_bytes()).await?;
        Ok(())
    }

    /// Loads the session's link key, tolerating a half-finished relocation
    /// by checking the other partition as a fallback.
    pub async fn load_key(&self, record: &SessionRecord) -> Result<LinkKey, SessionError> {
        let partition = Partition::for_status(record.status);
        let fallback = match partition {
            Partition::Active => Partition::Completed,
            Partition::Completed => Partition::Active,
        };
        for candidate in [partition, fallback] {
            let path = self.key_path(candidate, record);
            if let Ok(bytes) = afs::read(&path).await {
                let encoded = String::from_utf8(bytes).map_err(|_| {
                    SessionError::Persistence(format!("malformed key file for `{}`", record.id))
                })?;
                return LinkKey::from_base64(&encoded).ok_or_else(|| {
                    SessionError::Persistence(format!("malformed key file for `{}`", record.id))
                });
            }
        }
        Err(SessionError::Persistence(format!(
            "missing key file for `{}`",
            record.id
        )))
    }

    /// Finds a record by id, searching the active partition first, then
    /// completed. Returns `None` when no partition has it.
    pub async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        for partition in [Partition::Active, Partition::Completed] {
            if let Some(path) = self.find_record_file(partition, session_id).await? {
                let bytes = afs::read(&path).await?;
                let record: SessionRecord = serde_json::from_slice(&bytes)?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Lists a partition from its index, newest first. Entries whose
    /// backing record has disappeared are skipped (the record is
    /// authoritative); the index itself heals on the next write.
    pub async fn list(
        &self,
        partition: Partition,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, SessionError> {
        let index = self.read_index(partition).await?;
        let mut out = Vec::new();
        for summary in index.sessions {
            if self
                .find_record_file(partition, &summary.id)
                .await?
                .is_none()
            {
                warn!(session_id = %summary.id, "index entry has no backing record, skipping");
                continue;
            }
            out.push(summary);
        }
        match partition {
            Partition::Active => out.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            Partition::Completed => out.sort_by(|a, b| {
                b.completed_at
                    .unwrap_or(b.created_at)
                    .cmp(&a.completed_at.unwrap_or(a.created_at))
            }),
        }
        out.truncate(limit);
        Ok(out)
    }

    /// Moves a completed record (and its key) from the active partition to
    /// the completed one and swaps the index entries, as one logical
    /// operation. Safe to retry after a crash at any point: every step
    /// checks whether it already happened.
    pub async fn relocate_to_completed(&self, record: &SessionRecord) -> Result<(), SessionError> {
        if record.status != SessionStatus::Completed {
            return Err(SessionError::Persistence(format!(
                "refusing to relocate `{}` while {}",
                record.id, record.status
            )));
        }
        let done_path = self.record_path(Partition::Completed, record);
        let bytes = serde_json::to_vec_pretty(record)?;
        save_bytes_atomic(&done_path, &bytes).await?;

        let active_key = self.key_path(Partition::Active, record);
        let done_key = self.key_path(Partition::Completed, record);
        if afs::try_exists(&active_key).await.unwrap_or(false) {
            if !afs::try_exists(&done_key).await.unwrap_or(false) {
                let key_bytes = afs::read(&active_key).await?;
                save_bytes_atomic(&done_key, &key_bytes).await?;
            }
            afs::remove_file(&active_key).await?;
        }

        let active_path = self.record_path(Partition::Active, record);
        if afs::try_exists(&active_path).await.unwrap_or(false) {
            afs::remove_file(&active_path).await?;
        }

        let _guard = self.index_lock.lock().await;
        self.remove_index_entry_locked(Partition::Active, &record.id)
            .await?;
        self.upsert_index_locked(Partition::Completed, record.summary())
            .await?;
        info!(session_id = %record.id, "session relocated to completed partition");
        Ok(())
    }

    /// Removes a session's record, key and index entries from every
    /// partition.
    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        for partition in [Partition::Active, Partition::Completed] {
            if let Some(path) = self.find_record_file(partition, session_id).await? {
                afs::remove_file(&path).await?;
                let key = path.with_extension(KEY_EXT);
                if afs::try_exists(&key).await.unwrap_or(false) {
                    afs::remove_file(&key).await?;
                }
            }
        }
        let _guard = self.index_lock.lock().await;
        self.remove_index_entry_locked(Partition::Active, session_id)
            .await?;
        self.remove_index_entry_locked(Partition::Completed, session_id)
            .await?;
        info!(session_id, "session deleted from store");
        Ok(())
    }

    async fn find_record_file(
        &self,
        partition: Partition,
        session_id: &str,
    ) -> Result<Option<PathBuf>, SessionError> {
        let file_name = format!("{}.{}", session_id, RECORD_EXT);
        for date_dir in self.date_dirs(partition).await? {
            let candidate = date_dir.join(&file_name);
            if afs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn date_dirs(&self, partition: Partition) -> Result<Vec<PathBuf>, SessionError> {
        let mut out = Vec::new();
        let mut rd = match afs::read_dir(self.partition_dir(partition)).await {
            Ok(rd) => rd,
            Err(_) => return Ok(out),
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                out.push(entry.path());
            }
        }
        Ok(out)
    }

    async fn record_files(&self, partition: Partition) -> Result<Vec<PathBuf>, SessionError> {
        let mut out = Vec::new();
        for date_dir in self.date_dirs(partition).await? {
            let mut rd = match afs::read_dir(&date_dir).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = rd.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                    out.push(path);
                }
            }
        }
        Ok(out)
    }

    async fn read_index(&self, partition: Partition) -> Result<IndexFile, SessionError> {
        match afs::read(self.index_path(partition)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(_) => Ok(IndexFile::default()),
        }
    }

    async fn write_index(&self, partition: Partition, mut index: IndexFile) -> Result<(), SessionError> {
        index.updated = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&index)?;
        save_bytes_atomic(&self.index_path(partition), &bytes).await?;
        Ok(())
    }

    async fn upsert_index(
        &self,
        partition: Partition,
        summary: SessionSummary,
    ) -> Result<(), SessionError> {
        let _guard = self.index_lock.lock().await;
        self.upsert_index_locked(partition, summary).await
    }

    async fn upsert_index_locked(
        &self,
        partition: Partition,
        summary: SessionSummary,
    ) -> Result<(), SessionError> {
        let mut index = self.read_index(partition).await?;
        match index.sessions.iter_mut().find(|s| s.id == summary.id) {
            Some(existing) => *existing = summary,
            None => index.sessions.push(summary),
        }
        self.write_index(partition, index).await
    }

    async fn remove_index_entry_locked(
        &self,
        partition: Partition,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let mut index = self.read_index(partition).await?;
        let before = index.sessions.len();
        index.sessions.retain(|s| s.id != session_id);
        if index.sessions.len() != before {
            self.write_index(partition, index).await?;
        }
        Ok(())
    }

    /// Post-crash reconciliation. A crash can leave three divergences, all
    /// repaired here from the records (the authoritative side):
    /// - a session present in both partitions (interrupted relocation):
    ///   the completed copy wins and the active leftovers are purged;
    /// - a record with no index entry (crash between record and index
    ///   write): it is re-indexed;
    /// - an index entry with no record (crash during delete): dropped.
    async fn reconcile(&self) -> Result<(), SessionError> {
        let mut completed_ids: Vec<String> = Vec::new();
        for path in self.record_files(Partition::Completed).await? {
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                completed_ids.push(id.to_string());
            }
        }
        for path in self.record_files(Partition::Active).await? {
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            if completed_ids.contains(&id) {
                warn!(session_id = %id, "purging active leftovers of relocated session");
                let key = path.with_extension(KEY_EXT);
                if afs::try_exists(&key).await.unwrap_or(false) {
                    afs::remove_file(&key).await?;
                }
                afs::remove_file(&path).await?;
            }
        }

        let _guard = self.index_lock.lock().await;
        for partition in [Partition::Active, Partition::Completed] {
            let mut summaries: HashMap<String, SessionSummary> = HashMap::new();
            for path in self.record_files(partition).await? {
                let bytes = afs::read(&path).await?;
                match serde_json::from_slice::<SessionRecord>(&bytes) {
                    Ok(record) => {
                        summaries.insert(record.id.clone(), record.summary());
                    }
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unreadable session record");
                    }
                }
            }
            let index = self.read_index(partition).await?;
            let known: Vec<&str> = index.sessions.iter().map(|s| s.id.as_str()).collect();
            let stale = index
                .sessions
                .iter()
                .any(|s| !summaries.contains_key(&s.id));
            let missing = summaries.keys().any(|id| !known.contains(&id.as_str()));
            if stale || missing {
                info!(
                    partition = partition.dir_name(),
                    "rebuilding session index from records"
                );
                let mut sessions: Vec<SessionSummary> = summaries.into_values().collect();
                sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.write_index(partition, IndexFile {
                    updated: None,
                    sessions,
                })
                .await?;
            }
        }
        Ok(())
    }
}

/// Write-then-rename so a concurrent reader sees either the old bytes or
/// the new bytes, never a torn file.
async fn save_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        afs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    afs::write(&tmp, bytes).await?;
    match afs::rename(&tmp, path).await {
        Ok(_) => Ok(()),
        Err(_) => {
            let _ = afs::remove_file(path).await;
            let result = afs::rename(&tmp, path).await;
            if result.is_err() {
                let _ = afs::remove_file(&tmp).await;
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotvote_protocol::{CreatorRole, SessionSettings};

    fn sample_record(title: &str) -> SessionRecord {
        let mut record = SessionRecord::new(
            title,
            "",
            "organizer-1",
            CreatorRole::Owner,
            SessionSettings::default(),
        );
        record.add_item("Pizza", "").expect("add item");
        record
    }

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn record_and_key_round_trip() {
        let (_dir, store) = store().await;
        let record = sample_record("Lunch");
        let key = LinkKey::generate();
        store.save(&record).await.expect("save");
        store.save_key(&record, &key).await.expect("save key");

        let loaded = store
            .load(&record.id)
            .await
            .expect("load")
            .expect("record exists");
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.title, "Lunch");
        let loaded_key = store.load_key(&loaded).await.expect("load key");
        assert_eq!(loaded_key.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn unknown_session_loads_as_none() {
        let (_dir, store) = store().await;
        assert!(store.load("missing").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn listing_reads_the_index_per_partition() {
        let (_dir, store) = store().await;
        let first = sample_record("First");
        let second = sample_record("Second");
        store.save(&first).await.expect("save first");
        store.save(&second).await.expect("save second");

        let active = store.list(Partition::Active, 100).await.expect("list");
        assert_eq!(active.len(), 2);
        assert!(store
            .list(Partition::Completed, 100)
            .await
            .expect("list completed")
            .is_empty());

        let limited = store.list(Partition::Active, 1).await.expect("list");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn relocation_is_idempotent() {
        let (_dir, store) = store().await;
        let mut record = sample_record("Retro");
        let key = LinkKey::generate();
        store.save(&record).await.expect("save");
        store.save_key(&record, &key).await.expect("save key");
        record.start().expect("start");
        store.save(&record).await.expect("save active");
        record.complete().expect("complete");

        store
            .relocate_to_completed(&record)
            .await
            .expect("relocate");
        // Crash-retry: running the same relocation again must be a no-op.
        store
            .relocate_to_completed(&record)
            .await
            .expect("relocate again");

        assert!(store
            .list(Partition::Active, 100)
            .await
            .expect("active list")
            .is_empty());
        let completed = store
            .list(Partition::Completed, 100)
            .await
            .expect("completed list");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, SessionStatus::Completed);
        // Key follows the record into the completed partition.
        let loaded = store
            .load(&record.id)
            .await
            .expect("load")
            .expect("record exists");
        let loaded_key = store.load_key(&loaded).await.expect("key available");
        assert_eq!(loaded_key.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn relocation_requires_completed_status() {
        let (_dir, store) = store().await;
        let record = sample_record("Draft");
        store.save(&record).await.expect("save");
        assert!(store.relocate_to_completed(&record).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_record_key_and_index_entry() {
        let (_dir, store) = store().await;
        let record = sample_record("Doomed");
        store.save(&record).await.expect("save");
        store
            .save_key(&record, &LinkKey::generate())
            .await
            .expect("save key");

        store.delete(&record.id).await.expect("delete");
        assert!(store.load(&record.id).await.expect("load").is_none());
        assert!(store
            .list(Partition::Active, 100)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn stale_index_entries_are_filtered_from_listings() {
        let (dir, store) = store().await;
        let record = sample_record("Ghost");
        store.save(&record).await.expect("save");

        // Simulate a crash that removed the record but not the index entry.
        let date = record.created_at.format("%Y-%m-%d").to_string();
        let path = dir
            .path()
            .join("active")
            .join(date)
            .join(format!("{}.json", record.id));
        std::fs::remove_file(path).expect("remove record behind the store's back");

        assert!(store
            .list(Partition::Active, 100)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn reopen_reindexes_unindexed_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = sample_record("Orphan");
        {
            let store = SessionStore::open(dir.path()).await.expect("open");
            store.save(&record).await.expect("save");
            // Simulate a crash between the record write and the index write.
            std::fs::write(
                dir.path().join("active").join(INDEX_FILE),
                b"{\"sessions\":[]}",
            )
            .expect("truncate index");
        }
        let store = SessionStore::open(dir.path()).await.expect("reopen");
        let active = store.list(Partition::Active, 100).await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, record.id);
    }

    #[tokio::test]
    async fn reopen_purges_interrupted_relocation_leftovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut record = sample_record("Halfway");
        {
            let store = SessionStore::open(dir.path()).await.expect("open");
            store.save(&record).await.expect("save draft");
            record.start().expect("start");
            store.save(&record).await.expect("save active");
            record.complete().expect("complete");
            // Write the completed copy but "crash" before cleaning up the
            // active side or the indexes.
            let date = record.created_at.format("%Y-%m-%d").to_string();
            let done = dir
                .path()
                .join("completed")
                .join(&date)
                .join(format!("{}.json", record.id));
            std::fs::create_dir_all(done.parent().expect("parent")).expect("mkdir");
            std::fs::write(&done, serde_json::to_vec_pretty(&record).expect("encode"))
                .expect("write completed copy");
        }
        let store = SessionStore::open(dir.path()).await.expect("reopen");
        assert!(store
            .list(Partition::Active, 100)
            .await
            .expect("active")
            .is_empty());
        let completed = store.list(Partition::Completed, 100).await.expect("done");
        assert_eq!(completed.len(), 1);
        let loaded = store
            .load(&record.id)
            .await
            .expect("load")
            .expect("record exists");
        assert_eq!(loaded.status, SessionStatus::Completed);
    }
}
