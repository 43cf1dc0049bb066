//! Local-first activity service.
//!
//! Every mutation lands in the local cache first and returns immediately. The
//! remote write runs in a spawned task; when it cannot complete, the change
//! goes to the pending-change ledger for a later drain.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use socialmap_core::approval::apply_tag_approval;
use socialmap_core::merge::dedup_tags;
use socialmap_core::sanitize::{sanitize_activity, sanitize_patch};
use socialmap_core::{
    Activity, ActivityId, ActivityPatch, ActivitySettings, ActivityType, OutboundEvent, TimestampClock,
};
use socialmap_storage::{KvStore, LocalCache, StorageError, SyncState};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::EngineError;
use crate::ledger::{DrainReport, PendingChanges};
use crate::notify::Notifier;
use crate::remote::{RemoteApi, RemoteStoreClient, UpdateOutcome};

/// Outbound side of the realtime channel, as seen by the service.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: OutboundEvent);
}

/// Cheaply cloneable handle; clones share one cache, ledger and task set.
#[derive(Clone)]
pub struct HybridActivityService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    cache: Arc<Mutex<LocalCache>>,
    ledger: PendingChanges,
    remote: RemoteStoreClient,
    connectivity: Connectivity,
    notifier: Notifier,
    publisher: RwLock<Option<Arc<dyn EventPublisher>>>,
    clock: Mutex<TimestampClock>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config: SyncConfig,
}

enum CreateSettled {
    /// Deleted locally while the create was in flight.
    Deleted,
    Adopted(Activity),
    /// Edited locally while the create was in flight.
    Changed,
}

impl HybridActivityService {
    pub fn new(
        store: Box<dyn KvStore>,
        api: Arc<dyn RemoteApi>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = Arc::new(Mutex::new(LocalCache::new(store, &config.namespace)));
        let ledger = PendingChanges::load(cache.clone())?;
        let remote = RemoteStoreClient::new(api, config.max_update_retries, config.retry_backoff());
        let notifier = Notifier::new(config.notification_capacity);
        Ok(Self {
            inner: Arc::new(ServiceInner {
                cache,
                ledger,
                remote,
                connectivity,
                notifier,
                publisher: RwLock::new(None),
                clock: Mutex::new(TimestampClock::new()),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub fn set_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        *self.inner.publisher.write() = Some(publisher);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn ledger(&self) -> &PendingChanges {
        &self.inner.ledger
    }

    pub fn remote(&self) -> &RemoteStoreClient {
        &self.inner.remote
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub(crate) fn with_cache<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut LocalCache) -> Result<T, StorageError>,
    {
        let mut cache = self.inner.cache.lock();
        Ok(f(&mut *cache)?)
    }

    pub(crate) fn publish(&self, event: OutboundEvent) {
        let publisher = self.inner.publisher.read().clone();
        match publisher {
            Some(publisher) => publisher.publish(event),
            None => debug!(event = event.name(), "no realtime publisher attached"),
        }
    }

    fn tick(&self) -> DateTime<Utc> {
        self.inner.clock.lock().tick()
    }

    fn observe(&self, remote: DateTime<Utc>) {
        if let Err(e) = self.inner.clock.lock().observe(remote) {
            warn!(error = %e, "ignoring remote timestamp");
        }
    }

    pub fn sync_state(&self, id: &ActivityId) -> Result<SyncState, EngineError> {
        self.with_cache(|cache| cache.sync_state(id))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// All cached activities, with duplicate tags repaired.
    pub fn get_all(&self) -> Result<Vec<Activity>, EngineError> {
        self.with_cache(|cache| {
            let mut all = cache.get_all()?;
            let repaired: usize = all.iter_mut().map(|a| dedup_tags(&mut a.tags)).sum();
            if repaired > 0 {
                warn!(repaired, "removed duplicate tags");
                cache.save_all(&all)?;
            }
            Ok(all)
        })
    }

    /// The cached copy only, with duplicate tags repaired.
    pub fn get_local(&self, id: &ActivityId) -> Result<Option<Activity>, EngineError> {
        self.with_cache(|cache| {
            let Some(mut activity) = cache.get_by_id(id)? else {
                return Ok(None);
            };
            let repaired = dedup_tags(&mut activity.tags);
            if repaired > 0 {
                warn!(id = %id, repaired, "removed duplicate tags");
                cache.put(activity.clone())?;
            }
            Ok(Some(activity))
        })
    }

    /// Local first. A synced document is refreshed from the remote store when
    /// online; the remote copy wins unless the local one is strictly newer.
    pub async fn get_by_id(&self, id: &ActivityId) -> Result<Option<Activity>, EngineError> {
        let Some(local) = self.get_local(id)? else {
            return Ok(None);
        };
        if self.sync_state(id)? != SyncState::Synced || !self.is_online() {
            return Ok(Some(local));
        }
        match self.inner.remote.get_activity_by_id(id).await {
            Some(remote) => self.adopt_remote(remote),
            None => Ok(Some(local)),
        }
    }

    /// Store a remote copy unless the cached one is strictly newer. Returns
    /// the copy that ended up cached, or `None` if the document is no longer
    /// cached.
    pub(crate) fn adopt_remote(&self, mut remote: Activity) -> Result<Option<Activity>, EngineError> {
        dedup_tags(&mut remote.tags);
        self.observe(remote.updated_at);
        self.with_cache(|cache| {
            let Some(local) = cache.get_by_id(&remote.id)? else {
                return Ok(None);
            };
            if local.is_newer_than(&remote) {
                debug!(id = %remote.id, "keeping newer local copy");
                return Ok(Some(local));
            }
            if local != remote {
                cache.put(remote.clone())?;
            }
            Ok(Some(remote))
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create locally and schedule the remote create. Must be called from
    /// within a tokio runtime.
    pub fn create(
        &self,
        activity_type: ActivityType,
        settings: ActivitySettings,
    ) -> Result<Activity, EngineError> {
        let now = self.tick();
        let mut activity = Activity::new(ActivityId::generate(), activity_type, settings, now);
        sanitize_activity(&mut activity);

        let online = self.is_online();
        let state = if online {
            SyncState::PendingRemoteCreate
        } else {
            SyncState::Local
        };
        self.with_cache(|cache| {
            cache.create(activity.clone())?;
            cache.set_sync_state(&activity.id, state)
        })?;
        info!(id = %activity.id, activity_type = activity_type.as_str(), online, "created activity");

        if online {
            let this = self.clone();
            let id = activity.id.clone();
            self.spawn_remote(async move {
                tokio::time::sleep(this.inner.config.settle_delay()).await;
                if let Err(e) = this.remote_create(&id).await {
                    warn!(id = %id, error = %e, "remote create step failed");
                }
            });
        } else {
            self.inner.ledger.add_create_change(activity.clone())?;
        }
        Ok(activity)
    }

    /// Copy of an activity's settings as a new activity.
    pub fn clone_activity(&self, id: &ActivityId) -> Result<Activity, EngineError> {
        let source = self
            .with_cache(|cache| cache.get_by_id(id))?
            .ok_or_else(|| EngineError::ActivityNotFound(id.to_string()))?;
        let mut settings = source.settings;
        if let Some(title) = settings.title.as_mut() {
            title.push_str(" (Copy)");
        }
        self.create(source.activity_type, settings)
    }

    pub fn update(&self, id: &ActivityId, patch: ActivityPatch) -> Result<Activity, EngineError> {
        let mut patch = patch;
        sanitize_patch(&mut patch);
        let (activity, ()) = self.mutate(id, |activity| {
            if let Some(phase) = patch.phase.filter(|p| !p.is_valid_for(activity.activity_type)) {
                return Err(EngineError::InvalidPhase {
                    phase: phase.as_str(),
                    activity_type: activity.activity_type.as_str(),
                });
            }
            patch.apply_to(activity);
            Ok(())
        })?;
        Ok(activity)
    }

    /// Apply `f` to the cached document, then repair tags, recompute tag
    /// approval, stamp `updated_at` and schedule the remote write.
    pub(crate) fn mutate<T, F>(&self, id: &ActivityId, f: F) -> Result<(Activity, T), EngineError>
    where
        F: FnOnce(&mut Activity) -> Result<T, EngineError>,
    {
        let now = self.tick();
        let (activity, out) = {
            let mut cache = self.inner.cache.lock();
            let Some(mut activity) = cache.get_by_id(id)? else {
                return Err(EngineError::ActivityNotFound(id.to_string()));
            };
            let out = f(&mut activity)?;
            dedup_tags(&mut activity.tags);
            apply_tag_approval(&mut activity.tags, &activity.settings.tag_creation.voting);
            activity.touch(now);
            cache.put(activity.clone())?;
            (activity, out)
        };
        self.schedule_push(&activity)?;
        Ok((activity, out))
    }

    fn schedule_push(&self, activity: &Activity) -> Result<(), EngineError> {
        let id = activity.id.clone();
        match self.sync_state(&id)? {
            SyncState::PendingRemoteCreate => {
                debug!(id = %id, "remote create in flight, skipping remote update");
            }
            _ if !self.is_online() => {
                self.inner.ledger.add_update_change(activity.clone())?;
            }
            SyncState::Local => {
                let this = self.clone();
                self.spawn_remote(async move {
                    if let Err(e) = this.remote_create(&id).await {
                        warn!(id = %id, error = %e, "remote create step failed");
                    }
                });
            }
            SyncState::Synced => {
                let this = self.clone();
                self.spawn_remote(async move {
                    if let Err(e) = this.push_update(&id).await {
                        warn!(id = %id, error = %e, "remote update step failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Delete locally and schedule the remote delete. Deleting an unknown id
    /// still reaches the remote store, where a missing document is success.
    pub fn delete(&self, id: &ActivityId) -> Result<(), EngineError> {
        let (existed, state) = self.with_cache(|cache| {
            let state = cache.sync_state(id)?;
            let existed = cache.delete(id)?;
            Ok((existed, state))
        })?;
        self.inner.ledger.discard(id)?;
        info!(id = %id, existed, "deleted activity");

        if state == SyncState::PendingRemoteCreate {
            debug!(id = %id, "remote create in flight, it settles the delete");
            return Ok(());
        }
        if !self.is_online() {
            self.inner.ledger.add_delete_change(id.clone())?;
            return Ok(());
        }
        let this = self.clone();
        let id = id.clone();
        self.spawn_remote(async move {
            if let Err(e) = this.push_delete(&id).await {
                warn!(id = %id, error = %e, "remote delete step failed");
            }
        });
        Ok(())
    }

    // ========================================================================
    // Remote steps
    // ========================================================================

    /// Send the current cached copy as a remote create.
    async fn remote_create(&self, id: &ActivityId) -> Result<(), EngineError> {
        let Some(sent) = self.with_cache(|cache| cache.get_by_id(id))? else {
            debug!(id = %id, "deleted before the remote create was sent");
            self.with_cache(|cache| cache.confirm_deletion(id))?;
            return Ok(());
        };
        if !self.is_online() {
            self.with_cache(|cache| cache.set_sync_state(id, SyncState::Local))?;
            self.inner.ledger.add_create_change(sent)?;
            return Ok(());
        }

        match self.inner.remote.create_activity(&sent).await {
            Some(created) => self.settle_created(sent, created).await,
            None => {
                let latest = self.with_cache(|cache| {
                    let latest = cache.get_by_id(id)?;
                    if latest.is_some() {
                        cache.set_sync_state(id, SyncState::Local)?;
                    }
                    Ok(latest)
                })?;
                match latest {
                    Some(doc) => self.inner.ledger.add_create_change(doc)?,
                    // The create may have landed even though it failed here.
                    None => self.inner.ledger.add_delete_change(id.clone())?,
                }
                Ok(())
            }
        }
    }

    async fn settle_created(&self, sent: Activity, created: Activity) -> Result<(), EngineError> {
        let id = sent.id.clone();
        let settled = self.with_cache(|cache| {
            let Some(current) = cache.get_by_id(&id)? else {
                return Ok(CreateSettled::Deleted);
            };
            cache.set_sync_state(&id, SyncState::Synced)?;
            if current != sent {
                return Ok(CreateSettled::Changed);
            }
            let mut canonical = created.clone();
            dedup_tags(&mut canonical.tags);
            if current.is_newer_than(&canonical) {
                return Ok(CreateSettled::Adopted(current));
            }
            cache.put(canonical.clone())?;
            Ok(CreateSettled::Adopted(canonical))
        })?;
        self.inner.ledger.settle(&sent)?;

        match settled {
            CreateSettled::Deleted => {
                info!(id = %id, "deleted while the remote create was in flight");
                self.push_delete(&id).await
            }
            CreateSettled::Adopted(activity) => {
                self.publish(OutboundEvent::CreateActivity { activity });
                Ok(())
            }
            CreateSettled::Changed => {
                debug!(id = %id, "edited during remote create, pushing follow-up update");
                self.publish(OutboundEvent::CreateActivity { activity: created });
                self.push_update(&id).await
            }
        }
    }

    async fn push_update(&self, id: &ActivityId) -> Result<(), EngineError> {
        let Some(doc) = self.with_cache(|cache| cache.get_by_id(id))? else {
            return Ok(());
        };
        if !self.is_online() {
            self.inner.ledger.add_update_change(doc)?;
            return Ok(());
        }

        let outcome = self.inner.remote.update_activity(&doc).await;
        match outcome.and_then(UpdateOutcome::applied) {
            Some(canonical) => {
                self.inner.ledger.settle(&doc)?;
                if let Some(activity) = self.adopt_remote(canonical)? {
                    self.publish(OutboundEvent::UpdateActivity { activity });
                }
            }
            None => {
                if let Some(latest) = self.with_cache(|cache| cache.get_by_id(id))? {
                    self.inner.ledger.add_update_change(latest)?;
                }
            }
        }
        Ok(())
    }

    async fn push_delete(&self, id: &ActivityId) -> Result<(), EngineError> {
        if self.inner.remote.delete_activity(id).await {
            self.with_cache(|cache| cache.confirm_deletion(id))?;
            self.publish(OutboundEvent::DeleteActivity {
                activity_id: id.clone(),
            });
        } else {
            self.inner.ledger.add_delete_change(id.clone())?;
        }
        Ok(())
    }

    /// Replay the ledger and adopt what the store confirmed.
    pub async fn drain_pending(&self) -> Result<DrainReport, EngineError> {
        let report = self.inner.ledger.process_changes(&self.inner.remote).await?;
        for created in &report.created {
            self.with_cache(|cache| {
                if cache.contains(&created.id)? {
                    cache.set_sync_state(&created.id, SyncState::Synced)?;
                }
                Ok(())
            })?;
            if let Some(activity) = self.adopt_remote(created.clone())? {
                self.publish(OutboundEvent::CreateActivity { activity });
            }
        }
        for updated in &report.updated {
            if let Some(activity) = self.adopt_remote(updated.clone())? {
                self.publish(OutboundEvent::UpdateActivity { activity });
            }
        }
        for id in &report.deleted {
            self.with_cache(|cache| cache.confirm_deletion(id))?;
            self.publish(OutboundEvent::DeleteActivity {
                activity_id: id.clone(),
            });
        }
        Ok(report)
    }

    // ========================================================================
    // Inbound changes from other sessions
    // ========================================================================

    /// Apply a change that originated elsewhere: local cache only, no remote
    /// write, `updated_at` untouched. `f` reports whether it changed anything;
    /// unchanged documents are not rewritten. `None` if the activity is not
    /// cached.
    pub(crate) fn apply_inbound<F>(&self, id: &ActivityId, f: F) -> Result<Option<bool>, EngineError>
    where
        F: FnOnce(&mut Activity) -> bool,
    {
        self.with_cache(|cache| {
            let Some(mut activity) = cache.get_by_id(id)? else {
                return Ok(None);
            };
            let mut changed = f(&mut activity);
            changed |= dedup_tags(&mut activity.tags) > 0;
            if changed {
                cache.put(activity)?;
            }
            Ok(Some(changed))
        })
    }

    /// Adopt an activity another session created, unless it is already cached
    /// or this session deleted it.
    pub(crate) fn apply_remote_created(&self, mut activity: Activity) -> Result<bool, EngineError> {
        dedup_tags(&mut activity.tags);
        self.with_cache(|cache| {
            if cache.contains(&activity.id)? || cache.is_pending_deletion(&activity.id)? {
                return Ok(false);
            }
            cache.put(activity)?;
            Ok(true)
        })
    }

    pub(crate) fn apply_remote_deleted(&self, id: &ActivityId) -> Result<bool, EngineError> {
        let removed = self.with_cache(|cache| cache.remove(id))?;
        self.inner.ledger.discard(id)?;
        Ok(removed)
    }

    // ========================================================================
    // Task tracking
    // ========================================================================

    fn spawn_remote<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Wait for every spawned remote step, including ones spawned while
    /// waiting.
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.inner.tasks.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "remote task failed to complete");
                }
            }
        }
    }
}
