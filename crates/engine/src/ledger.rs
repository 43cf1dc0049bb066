//! Durable queue of remote writes that could not be applied yet.
//!
//! Each kind of change is keyed by activity id, so a later change supersedes
//! an earlier one and replaying the ledger never writes the same edit twice.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socialmap_core::{Activity, ActivityId};
use socialmap_storage::{LocalCache, StorageError, read_json, write_json};
use tracing::{debug, info, warn};

use crate::remote::{RemoteStoreClient, UpdateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One queued change as presented to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub kind: ChangeKind,
    pub id: ActivityId,
    pub data: Option<Activity>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct LedgerState {
    creates: BTreeMap<ActivityId, Activity>,
    updates: BTreeMap<ActivityId, Activity>,
    deletes: BTreeSet<ActivityId>,
}

impl LedgerState {
    fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

/// Result of one drain. Confirmed documents are the store's canonical
/// copies so the caller can adopt them.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    pub success: bool,
    /// Another drain was already running; nothing was attempted.
    pub skipped: bool,
    pub created: Vec<Activity>,
    pub updated: Vec<Activity>,
    pub deleted: Vec<ActivityId>,
    pub failed: usize,
    pub remaining: usize,
}

impl DrainReport {
    pub fn confirmed(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

pub struct PendingChanges {
    state: Mutex<LedgerState>,
    cache: Arc<Mutex<LocalCache>>,
    draining: AtomicBool,
}

impl PendingChanges {
    /// Load persisted changes from the cache's store.
    pub fn load(cache: Arc<Mutex<LocalCache>>) -> Result<Self, StorageError> {
        let state = {
            let guard = cache.lock();
            let ns = guard.namespace();
            let store = guard.store();
            let creates: Vec<Activity> =
                read_json(store, &format!("{ns}_pending_create"))?.unwrap_or_default();
            let updates: Vec<Activity> =
                read_json(store, &format!("{ns}_pending_update"))?.unwrap_or_default();
            let deletes: Vec<ActivityId> =
                read_json(store, &format!("{ns}_pending_delete"))?.unwrap_or_default();
            LedgerState {
                creates: creates.into_iter().map(|a| (a.id.clone(), a)).collect(),
                updates: updates.into_iter().map(|a| (a.id.clone(), a)).collect(),
                deletes: deletes.into_iter().collect(),
            }
        };
        if state.len() > 0 {
            info!(pending = state.len(), "loaded pending changes");
        }
        Ok(Self {
            state: Mutex::new(state),
            cache,
            draining: AtomicBool::new(false),
        })
    }

    fn persist(&self, state: &LedgerState) -> Result<(), StorageError> {
        let mut guard = self.cache.lock();
        let ns = guard.namespace().to_string();
        let store = guard.store_mut();
        let creates: Vec<&Activity> = state.creates.values().collect();
        let updates: Vec<&Activity> = state.updates.values().collect();
        let deletes: Vec<&ActivityId> = state.deletes.iter().collect();
        write_json(store, &format!("{ns}_pending_create"), &creates)?;
        write_json(store, &format!("{ns}_pending_update"), &updates)?;
        write_json(store, &format!("{ns}_pending_delete"), &deletes)?;
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut LedgerState),
    {
        let mut state = self.state.lock();
        let before = state.clone();
        f(&mut *state);
        if *state != before {
            self.persist(&*state)?;
        }
        Ok(())
    }

    pub fn add_create_change(&self, activity: Activity) -> Result<(), StorageError> {
        debug!(id = %activity.id, "queue create");
        self.mutate(|state| {
            state.deletes.remove(&activity.id);
            state.updates.remove(&activity.id);
            state.creates.insert(activity.id.clone(), activity);
        })
    }

    /// Queue the latest copy of a document. A pending create for the same id
    /// absorbs the update.
    pub fn add_update_change(&self, activity: Activity) -> Result<(), StorageError> {
        debug!(id = %activity.id, "queue update");
        self.mutate(|state| {
            if state.deletes.contains(&activity.id) {
                return;
            }
            if let Some(create) = state.creates.get_mut(&activity.id) {
                *create = activity;
            } else {
                state.updates.insert(activity.id.clone(), activity);
            }
        })
    }

    pub fn add_delete_change(&self, id: ActivityId) -> Result<(), StorageError> {
        debug!(id = %id, "queue delete");
        self.mutate(|state| {
            state.creates.remove(&id);
            state.updates.remove(&id);
            state.deletes.insert(id);
        })
    }

    /// Drop every queued change for `id`.
    pub fn discard(&self, id: &ActivityId) -> Result<(), StorageError> {
        self.mutate(|state| {
            state.creates.remove(id);
            state.updates.remove(id);
            state.deletes.remove(id);
        })
    }

    /// Drop queued creates and updates that `sent` already covers, after the
    /// store accepted it outside a drain.
    pub fn settle(&self, sent: &Activity) -> Result<(), StorageError> {
        let covered = |queued: Option<&Activity>| {
            queued.is_some_and(|queued| queued.updated_at <= sent.updated_at)
        };
        self.mutate(|state| {
            if covered(state.creates.get(&sent.id)) {
                state.creates.remove(&sent.id);
            }
            if covered(state.updates.get(&sent.id)) {
                state.updates.remove(&sent.id);
            }
        })
    }

    pub fn has_pending_changes(&self) -> bool {
        self.pending_change_count() > 0
    }

    pub fn pending_change_count(&self) -> usize {
        self.state.lock().len()
    }

    pub fn has_pending_change_for(&self, id: &ActivityId) -> bool {
        let state = self.state.lock();
        state.creates.contains_key(id) || state.updates.contains_key(id) || state.deletes.contains(id)
    }

    pub fn pending_ids(&self) -> BTreeSet<ActivityId> {
        let state = self.state.lock();
        state
            .creates
            .keys()
            .chain(state.updates.keys())
            .chain(state.deletes.iter())
            .cloned()
            .collect()
    }

    pub fn changes(&self) -> Vec<PendingChange> {
        let state = self.state.lock();
        let creates = state.creates.values().map(|a| PendingChange {
            kind: ChangeKind::Create,
            id: a.id.clone(),
            data: Some(a.clone()),
        });
        let updates = state.updates.values().map(|a| PendingChange {
            kind: ChangeKind::Update,
            id: a.id.clone(),
            data: Some(a.clone()),
        });
        let deletes = state.deletes.iter().map(|id| PendingChange {
            kind: ChangeKind::Delete,
            id: id.clone(),
            data: None,
        });
        creates.chain(updates).chain(deletes).collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replay creates, then updates, then deletes. An entry is removed only
    /// after the store confirms it and only if no newer change replaced it
    /// while the request was in flight.
    pub async fn process_changes(&self, remote: &RemoteStoreClient) -> Result<DrainReport, StorageError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already running");
            return Ok(DrainReport {
                skipped: true,
                remaining: self.pending_change_count(),
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.state.lock().clone();
        if snapshot.len() == 0 {
            return Ok(DrainReport {
                success: true,
                ..Default::default()
            });
        }
        info!(
            creates = snapshot.creates.len(),
            updates = snapshot.updates.len(),
            deletes = snapshot.deletes.len(),
            "draining pending changes"
        );

        let mut report = DrainReport::default();

        for (id, doc) in &snapshot.creates {
            match remote.create_activity(doc).await {
                Some(created) => {
                    self.mutate(|state| {
                        if state.creates.get(id) == Some(doc) {
                            state.creates.remove(id);
                        }
                    })?;
                    report.created.push(created);
                }
                None => report.failed += 1,
            }
        }

        for (id, doc) in &snapshot.updates {
            let outcome = remote.update_activity(doc).await;
            match outcome {
                Some(UpdateOutcome::Applied(updated)) => {
                    self.mutate(|state| {
                        if state.updates.get(id) == Some(doc) {
                            state.updates.remove(id);
                        }
                    })?;
                    report.updated.push(updated);
                }
                Some(UpdateOutcome::Stale(_)) | None => report.failed += 1,
            }
        }

        for id in &snapshot.deletes {
            if remote.delete_activity(id).await {
                self.mutate(|state| {
                    state.deletes.remove(id);
                })?;
                report.deleted.push(id.clone());
            } else {
                report.failed += 1;
            }
        }

        report.success = report.failed == 0;
        report.remaining = self.pending_change_count();
        if report.success {
            info!(confirmed = report.confirmed(), remaining = report.remaining, "drain complete");
        } else {
            warn!(
                confirmed = report.confirmed(),
                failed = report.failed,
                remaining = report.remaining,
                "drain left changes queued"
            );
        }
        Ok(report)
    }
}

/// RAII guard to reset the draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use socialmap_core::{ActivitySettings, ActivityType, Phase};
    use socialmap_storage::{KvStore, MemoryKv};

    fn shared_cache() -> Arc<Mutex<LocalCache>> {
        Arc::new(Mutex::new(LocalCache::new(Box::new(MemoryKv::new()), "test")))
    }

    fn doc(id: &str) -> Activity {
        Activity::new(
            ActivityId::from(id),
            ActivityType::Mapping,
            ActivitySettings::default(),
            Utc::now(),
        )
    }

    #[test]
    fn later_change_supersedes_earlier() -> Result<(), StorageError> {
        let ledger = PendingChanges::load(shared_cache())?;
        let mut first = doc("a-1");
        ledger.add_update_change(first.clone())?;
        first.phase = Phase::Tagging;
        ledger.add_update_change(first.clone())?;

        assert_eq!(ledger.pending_change_count(), 1);
        assert_eq!(ledger.changes()[0].data.as_ref().map(|a| a.phase), Some(Phase::Tagging));
        Ok(())
    }

    #[test]
    fn update_folds_into_pending_create() -> Result<(), StorageError> {
        let ledger = PendingChanges::load(shared_cache())?;
        let mut activity = doc("a-1");
        ledger.add_create_change(activity.clone())?;
        activity.phase = Phase::Mapping;
        ledger.add_update_change(activity)?;

        let changes = ledger.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Create);
        assert_eq!(changes[0].data.as_ref().map(|a| a.phase), Some(Phase::Mapping));
        Ok(())
    }

    #[test]
    fn delete_drops_create_and_update() -> Result<(), StorageError> {
        let ledger = PendingChanges::load(shared_cache())?;
        ledger.add_create_change(doc("a-1"))?;
        ledger.add_update_change(doc("a-2"))?;
        ledger.add_delete_change(ActivityId::from("a-1"))?;
        ledger.add_delete_change(ActivityId::from("a-2"))?;
        ledger.add_update_change(doc("a-2"))?;

        let kinds: Vec<ChangeKind> = ledger.changes().into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Delete, ChangeKind::Delete]);
        assert!(ledger.has_pending_change_for(&ActivityId::from("a-1")));
        Ok(())
    }

    #[test]
    fn survives_reload() -> Result<(), StorageError> {
        let cache = shared_cache();
        {
            let ledger = PendingChanges::load(cache.clone())?;
            ledger.add_create_change(doc("a-1"))?;
            ledger.add_update_change(doc("a-2"))?;
            ledger.add_delete_change(ActivityId::from("a-3"))?;
        }
        assert!(cache.lock().store().get("test_pending_delete")?.is_some());

        let reloaded = PendingChanges::load(cache)?;
        assert_eq!(reloaded.pending_change_count(), 3);
        assert_eq!(
            reloaded.pending_ids().into_iter().map(|id| id.into_inner()).collect::<Vec<_>>(),
            vec!["a-1", "a-2", "a-3"]
        );
        Ok(())
    }

    #[test]
    fn discard_and_settle() -> Result<(), StorageError> {
        let ledger = PendingChanges::load(shared_cache())?;
        let activity = doc("a-1");
        ledger.add_create_change(activity.clone())?;

        let mut older = activity.clone();
        older.updated_at = activity.updated_at - chrono::Duration::seconds(1);
        ledger.settle(&older)?;
        assert!(ledger.has_pending_changes());
        ledger.settle(&activity)?;
        assert!(!ledger.has_pending_changes());

        ledger.add_update_change(doc("a-3"))?;
        let mut newer = doc("a-3");
        newer.updated_at += chrono::Duration::seconds(5);
        ledger.settle(&newer)?;
        assert!(!ledger.has_pending_changes());

        ledger.add_delete_change(ActivityId::from("a-2"))?;
        ledger.discard(&ActivityId::from("a-2"))?;
        assert_eq!(ledger.pending_change_count(), 0);
        Ok(())
    }
}
