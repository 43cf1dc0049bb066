//! Client-side document cache.
//!
//! The whole activity list lives under one key and is rewritten on every
//! mutation. Sync state and the deletion queue are kept under their own keys
//! so documents stay identical to what the remote store holds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use socialmap_core::{Activity, ActivityId};
use tracing::debug;

use crate::error::StorageError;
use crate::memory::MemoryKv;
use crate::traits::{KvStore, read_json, write_json};

pub const DEFAULT_NAMESPACE: &str = "socialmap";

/// How far a cached document has travelled towards the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// A remote create was attempted and failed; the document waits in the
    /// pending-change ledger.
    Local,
    /// Created locally with the remote create still in flight. Remote updates
    /// for the document are suppressed until the create resolves.
    PendingRemoteCreate,
    Synced,
}

pub struct LocalCache {
    store: Box<dyn KvStore>,
    namespace: String,
}

impl LocalCache {
    pub fn new(store: Box<dyn KvStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryKv::new()), DEFAULT_NAMESPACE)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Shared with the pending-change ledger so both persist side by side.
    pub fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn KvStore {
        self.store.as_mut()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.namespace, suffix)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    pub fn get_all(&self) -> Result<Vec<Activity>, StorageError> {
        let key = self.key("activities");
        Ok(read_json(self.store(), &key)?.unwrap_or_default())
    }

    pub fn save_all(&mut self, activities: &[Activity]) -> Result<(), StorageError> {
        let key = self.key("activities");
        write_json(self.store.as_mut(), &key, activities)
    }

    pub fn get_by_id(&self, id: &ActivityId) -> Result<Option<Activity>, StorageError> {
        Ok(self.get_all()?.into_iter().find(|a| &a.id == id))
    }

    pub fn contains(&self, id: &ActivityId) -> Result<bool, StorageError> {
        Ok(self.get_all()?.iter().any(|a| &a.id == id))
    }

    /// Insert a new document. An existing document with the same id is
    /// replaced.
    pub fn create(&mut self, activity: Activity) -> Result<Activity, StorageError> {
        self.put(activity.clone())?;
        debug!(id = %activity.id, "cached new activity");
        Ok(activity)
    }

    /// Insert or replace by id, keeping list order for existing documents.
    pub fn put(&mut self, activity: Activity) -> Result<(), StorageError> {
        let mut all = self.get_all()?;
        match all.iter_mut().find(|a| a.id == activity.id) {
            Some(slot) => *slot = activity,
            None => all.push(activity),
        }
        self.save_all(&all)
    }

    /// Read-modify-write a single document. The updater works on a copy; a
    /// missing document returns `None` and writes nothing.
    pub fn update<F>(&mut self, id: &ActivityId, updater: F) -> Result<Option<Activity>, StorageError>
    where
        F: FnOnce(Activity) -> Activity,
    {
        let mut all = self.get_all()?;
        let Some(slot) = all.iter_mut().find(|a| &a.id == id) else {
            return Ok(None);
        };
        let updated = updater(slot.clone());
        *slot = updated.clone();
        self.save_all(&all)?;
        Ok(Some(updated))
    }

    /// Remove a document and queue its id for remote deletion.
    pub fn delete(&mut self, id: &ActivityId) -> Result<bool, StorageError> {
        let removed = self.remove(id)?;
        let mut queue = self.deletion_queue()?;
        if !queue.contains(id) {
            queue.push(id.clone());
            let key = self.key("deletion_queue");
            write_json(self.store.as_mut(), &key, &queue)?;
        }
        debug!(id = %id, removed, "deleted activity locally");
        Ok(removed)
    }

    /// Remove a document without queueing anything, for deletions that
    /// originated elsewhere.
    pub fn remove(&mut self, id: &ActivityId) -> Result<bool, StorageError> {
        let mut all = self.get_all()?;
        let before = all.len();
        all.retain(|a| &a.id != id);
        let removed = all.len() != before;
        if removed {
            self.save_all(&all)?;
        }
        self.set_sync_state(id, SyncState::Synced)?;
        Ok(removed)
    }

    // ========================================================================
    // Deletion queue
    // ========================================================================

    pub fn deletion_queue(&self) -> Result<Vec<ActivityId>, StorageError> {
        let key = self.key("deletion_queue");
        Ok(read_json(self.store(), &key)?.unwrap_or_default())
    }

    pub fn is_pending_deletion(&self, id: &ActivityId) -> Result<bool, StorageError> {
        Ok(self.deletion_queue()?.contains(id))
    }

    /// Drop an id from the deletion queue once the remote store no longer has
    /// the document.
    pub fn confirm_deletion(&mut self, id: &ActivityId) -> Result<(), StorageError> {
        let mut queue = self.deletion_queue()?;
        let before = queue.len();
        queue.retain(|queued| queued != id);
        if queue.len() != before {
            let key = self.key("deletion_queue");
            write_json(self.store.as_mut(), &key, &queue)?;
        }
        Ok(())
    }

    // ========================================================================
    // Sync state
    // ========================================================================

    fn sync_states(&self) -> Result<BTreeMap<ActivityId, SyncState>, StorageError> {
        let key = self.key("sync_state");
        Ok(read_json(self.store(), &key)?.unwrap_or_default())
    }

    /// Documents without a recorded state are synced.
    pub fn sync_state(&self, id: &ActivityId) -> Result<SyncState, StorageError> {
        Ok(self
            .sync_states()?
            .get(id)
            .copied()
            .unwrap_or(SyncState::Synced))
    }

    /// Ids whose remote create has not been confirmed yet.
    pub fn unconfirmed_ids(&self) -> Result<BTreeSet<ActivityId>, StorageError> {
        Ok(self.sync_states()?.into_keys().collect())
    }

    pub fn set_sync_state(&mut self, id: &ActivityId, state: SyncState) -> Result<(), StorageError> {
        let mut states = self.sync_states()?;
        let changed = match state {
            SyncState::Synced => states.remove(id).is_some(),
            other => states.insert(id.clone(), other) != Some(other),
        };
        if changed {
            let key = self.key("sync_state");
            write_json(self.store.as_mut(), &key, &states)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteKv;
    use chrono::{Duration, TimeZone, Utc};
    use socialmap_core::*;

    fn activity(id: &str) -> Activity {
        Activity::new(
            ActivityId::from(id),
            ActivityType::Mapping,
            ActivitySettings::default(),
            Utc::now(),
        )
    }

    #[test]
    fn round_trip_preserves_every_timestamp() -> Result<(), StorageError> {
        let mut cache = LocalCache::new(Box::new(SqliteKv::open_in_memory()?), DEFAULT_NAMESPACE);
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap() + Duration::microseconds(123_456);
        let mut doc = Activity::new(
            ActivityId::from("a-1"),
            ActivityType::Mapping,
            ActivitySettings::default(),
            created,
        );
        doc.updated_at = created + Duration::minutes(5);
        let user = UserId::from("u-1");
        let mut tag = Tag::new("Parks", user.clone(), "Ana", created + Duration::seconds(1));
        tag.votes.push(Vote {
            user_id: user.clone(),
            user_name: "Ana".into(),
            timestamp: created + Duration::seconds(2),
        });
        tag.comments.push(Comment {
            id: CommentId::from("c-1"),
            user_id: user,
            user_name: "Ana".into(),
            text: "near the river".into(),
            timestamp: created + Duration::seconds(3),
        });
        doc.tags.push(tag);

        cache.create(doc.clone())?;
        let read = cache.get_by_id(&doc.id)?.unwrap();
        assert_eq!(read, doc);
        assert_eq!(read.tags[0].votes[0].timestamp, doc.tags[0].votes[0].timestamp);
        assert_eq!(read.tags[0].comments[0].timestamp, doc.tags[0].comments[0].timestamp);
        Ok(())
    }

    #[test]
    fn update_works_on_a_copy_and_ignores_missing() -> Result<(), StorageError> {
        let mut cache = LocalCache::in_memory();
        cache.create(activity("a-1"))?;

        let updated = cache.update(&ActivityId::from("a-1"), |mut a| {
            a.phase = Phase::Tagging;
            a
        })?;
        assert_eq!(updated.map(|a| a.phase), Some(Phase::Tagging));
        assert_eq!(
            cache.get_by_id(&ActivityId::from("a-1"))?.map(|a| a.phase),
            Some(Phase::Tagging)
        );

        let missing = cache.update(&ActivityId::from("nope"), |a| a)?;
        assert!(missing.is_none());
        assert_eq!(cache.get_all()?.len(), 1);
        Ok(())
    }

    #[test]
    fn put_replaces_in_place() -> Result<(), StorageError> {
        let mut cache = LocalCache::in_memory();
        cache.create(activity("a-1"))?;
        cache.create(activity("a-2"))?;
        let mut replacement = activity("a-1");
        replacement.phase = Phase::Mapping;
        cache.put(replacement)?;

        let all = cache.get_all()?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id.as_str(), "a-1");
        assert_eq!(all[0].phase, Phase::Mapping);
        Ok(())
    }

    #[test]
    fn delete_queues_once_and_remove_does_not() -> Result<(), StorageError> {
        let mut cache = LocalCache::in_memory();
        let id = ActivityId::from("a-1");
        cache.create(activity("a-1"))?;
        cache.create(activity("a-2"))?;

        assert!(cache.delete(&id)?);
        assert!(!cache.delete(&id)?);
        assert_eq!(cache.deletion_queue()?, vec![id.clone()]);
        assert!(cache.is_pending_deletion(&id)?);

        cache.confirm_deletion(&id)?;
        assert!(!cache.is_pending_deletion(&id)?);

        assert!(cache.remove(&ActivityId::from("a-2"))?);
        assert!(cache.deletion_queue()?.is_empty());
        assert!(cache.get_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn sync_state_defaults_to_synced() -> Result<(), StorageError> {
        let mut cache = LocalCache::in_memory();
        let id = ActivityId::from("a-1");
        assert_eq!(cache.sync_state(&id)?, SyncState::Synced);

        cache.set_sync_state(&id, SyncState::PendingRemoteCreate)?;
        assert_eq!(cache.sync_state(&id)?, SyncState::PendingRemoteCreate);
        cache.set_sync_state(&id, SyncState::Local)?;
        assert_eq!(cache.sync_state(&id)?, SyncState::Local);
        assert_eq!(cache.unconfirmed_ids()?, BTreeSet::from([id.clone()]));

        cache.set_sync_state(&id, SyncState::Synced)?;
        assert_eq!(cache.sync_state(&id)?, SyncState::Synced);
        assert!(
            cache
                .store()
                .get("socialmap_sync_state")?
                .is_some_and(|raw| raw == "{}")
        );
        Ok(())
    }

    #[test]
    fn namespaces_are_isolated() -> Result<(), StorageError> {
        let mut cache = LocalCache::new(Box::new(MemoryKv::new()), "other");
        cache.create(activity("a-1"))?;
        assert!(cache.store().get("other_activities")?.is_some());
        assert!(cache.store().get("socialmap_activities")?.is_none());
        Ok(())
    }

    #[test]
    fn reopened_file_keeps_documents_and_queue() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.db");
        {
            let mut cache = LocalCache::new(Box::new(SqliteKv::open(&path)?), DEFAULT_NAMESPACE);
            cache.create(activity("a-1"))?;
            cache.create(activity("a-2"))?;
            cache.delete(&ActivityId::from("a-2"))?;
            cache.set_sync_state(&ActivityId::from("a-1"), SyncState::Local)?;
        }

        let cache = LocalCache::new(Box::new(SqliteKv::open(&path)?), DEFAULT_NAMESPACE);
        assert_eq!(cache.get_all()?.len(), 1);
        assert!(cache.is_pending_deletion(&ActivityId::from("a-2"))?);
        assert_eq!(cache.sync_state(&ActivityId::from("a-1"))?, SyncState::Local);
        Ok(())
    }
}
