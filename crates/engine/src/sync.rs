//! Background reconciliation between the local cache and the remote store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use socialmap_core::merge::{Winner, dedup_tags, last_writer_wins};
use socialmap_core::{Activity, ActivityId, Notification, SyncStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::service::HybridActivityService;

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    service: HybridActivityService,
    running: AtomicBool,
    last_full_sync: Mutex<Option<Instant>>,
}

/// RAII guard to reset the running flag.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct MergeCounts {
    created: usize,
    updated: usize,
    deleted: usize,
}

impl SyncCoordinator {
    pub fn new(service: HybridActivityService) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                service,
                running: AtomicBool::new(false),
                last_full_sync: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Drain pending changes, then run a full reconciliation if the last one
    /// is older than the configured window. `None` if a pass is already
    /// running.
    pub async fn sync_now(&self) -> Option<SyncStatus> {
        self.run_pass(false).await
    }

    pub async fn force_full_sync(&self) -> Option<SyncStatus> {
        self.run_pass(true).await
    }

    async fn run_pass(&self, force_full: bool) -> Option<SyncStatus> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("sync already running");
            return None;
        }
        let _guard = PassGuard(&self.inner.running);

        let status = self.reconcile(force_full).await;
        let notifier = self.inner.service.notifier();
        if status.is_error() {
            warn!(error = ?status.error, "sync failed");
            notifier.emit(Notification::SyncError(status.clone()));
        } else {
            notifier.emit(Notification::SyncCompleted(status.clone()));
        }
        Some(status)
    }

    #[tracing::instrument(skip(self))]
    async fn reconcile(&self, force_full: bool) -> SyncStatus {
        let service = &self.inner.service;
        let mut status = SyncStatus::new(Utc::now());

        if !service.is_online() {
            status.pending = service.ledger().pending_change_count();
            status.error = Some("offline".into());
            return status;
        }

        match service.drain_pending().await {
            Ok(report) => status.drained = report.confirmed(),
            Err(e) => {
                status.error = Some(e.to_string());
                status.pending = service.ledger().pending_change_count();
                return status;
            }
        }

        if force_full || self.full_sync_due() {
            status.full_sync = true;
            match self.full_sync().await {
                Ok(counts) => {
                    status.created = counts.created;
                    status.updated = counts.updated;
                    status.deleted = counts.deleted;
                    *self.inner.last_full_sync.lock() = Some(Instant::now());
                }
                Err(e) => status.error = Some(e.to_string()),
            }
        }

        status.pending = service.ledger().pending_change_count();
        status.finished_at = Utc::now();
        info!(
            drained = status.drained,
            created = status.created,
            updated = status.updated,
            deleted = status.deleted,
            pending = status.pending,
            "sync pass finished"
        );
        status
    }

    fn full_sync_due(&self) -> bool {
        let window = self.inner.service.config().full_sync_window();
        match *self.inner.last_full_sync.lock() {
            Some(last) => last.elapsed() >= window,
            None => true,
        }
    }

    /// Merge the whole remote set into the cache by `updated_at`.
    ///
    /// Only documents that were already confirmed before the list request
    /// went out can be dropped as remotely deleted. A create confirmed while
    /// the request was in flight is missing from the stale list.
    async fn full_sync(&self) -> Result<MergeCounts, EngineError> {
        let service = &self.inner.service;
        let confirmed_before: BTreeSet<ActivityId> = service.with_cache(|cache| {
            let unconfirmed = cache.unconfirmed_ids()?;
            Ok(cache
                .get_all()?
                .into_iter()
                .map(|a| a.id)
                .filter(|id| !unconfirmed.contains(id))
                .collect())
        })?;
        let Some(remote) = service.remote().get_activities().await else {
            return Err(EngineError::RemoteUnavailable);
        };
        let pending = service.ledger().pending_ids();
        let remote_ids: BTreeSet<ActivityId> = remote.iter().map(|a| a.id.clone()).collect();

        let counts = service.with_cache(|cache| {
            let mut counts = MergeCounts::default();
            let mut local = cache.get_all()?;
            let unconfirmed = cache.unconfirmed_ids()?;

            for mut incoming in remote {
                dedup_tags(&mut incoming.tags);
                match local.iter_mut().find(|a| a.id == incoming.id) {
                    Some(existing) => {
                        if last_writer_wins(existing, &incoming) == Winner::Remote {
                            *existing = incoming;
                            counts.updated += 1;
                        }
                    }
                    None => {
                        if cache.is_pending_deletion(&incoming.id)? || pending.contains(&incoming.id) {
                            continue;
                        }
                        local.push(incoming);
                        counts.created += 1;
                    }
                }
            }

            let mut kept: Vec<Activity> = Vec::with_capacity(local.len());
            let mut dropped: Vec<ActivityId> = Vec::new();
            for activity in local {
                let remotely_deleted = !remote_ids.contains(&activity.id)
                    && !pending.contains(&activity.id)
                    && !unconfirmed.contains(&activity.id)
                    && confirmed_before.contains(&activity.id);
                if remotely_deleted {
                    dropped.push(activity.id);
                } else {
                    kept.push(activity);
                }
            }
            counts.deleted = dropped.len();
            cache.save_all(&kept)?;

            for id in cache.deletion_queue()? {
                if !remote_ids.contains(&id) {
                    cache.confirm_deletion(&id)?;
                }
            }
            Ok(counts)
        })?;

        debug!(?counts, "full sync merged");
        Ok(counts)
    }

    /// Sync after the initial delay, on every poll tick and whenever the
    /// client comes back online, until `shutdown` flips.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let config = this.inner.service.config().clone();
            let mut online = this.inner.service.connectivity().subscribe();

            tokio::select! {
                _ = tokio::time::sleep(config.initial_sync_delay()) => {}
                _ = shutdown.changed() => return,
            }
            this.sync_now().await;

            let mut interval = tokio::time::interval(config.poll_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.sync_now().await;
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            info!("back online, syncing");
                            this.sync_now().await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("sync loop stopped");
        })
    }
}
