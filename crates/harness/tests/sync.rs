use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use socialmap_core::{
    Activity, ActivityId, ActivityPatch, ActivitySettings, ActivityType, Notification, Phase, Tag,
    UserId,
};
use socialmap_engine::{
    ChangeKind, Connectivity, HybridActivityService, RemoteApi, RemoteError, SyncCoordinator,
    Versioned,
};
use socialmap_harness::{InMemoryRemote, RealtimeHub, TestSession, test_config};
use socialmap_storage::{DEFAULT_NAMESPACE, LocalCache, MemoryKv, SqliteKv, SyncState};
use tokio::sync::watch;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn titled(title: &str) -> ActivitySettings {
    ActivitySettings {
        title: Some(title.to_string()),
        ..Default::default()
    }
}

fn session() -> Result<(InMemoryRemote, TestSession), Box<dyn std::error::Error>> {
    let remote = InMemoryRemote::new();
    let hub = RealtimeHub::new();
    let session = TestSession::new(&remote, &hub)?;
    Ok((remote, session))
}

/// A synced activity the test can then diverge on either side.
async fn synced(session: &TestSession, title: &str) -> Result<Activity, Box<dyn std::error::Error>> {
    let activity = session.service.create(ActivityType::Mapping, titled(title))?;
    session.settle().await;
    let local = session.service.get_local(&activity.id)?.ok_or("missing")?;
    Ok(local)
}

// ============================================================================
// Pending-change ledger
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unreachable_remote_queues_then_drains_everything() -> TestResult {
    let (remote, session) = session()?;
    let kept = synced(&session, "Kept").await?;
    let doomed = synced(&session, "Doomed").await?;

    remote.set_reachable(false);
    let mut created = Vec::new();
    for title in ["One", "Two", "Three"] {
        created.push(session.service.create(ActivityType::Mapping, titled(title))?);
    }
    session.service.set_phase(&kept.id, Phase::Tagging)?;
    session.service.delete(&doomed.id)?;
    session.settle().await;

    let ledger = session.service.ledger();
    assert_eq!(ledger.pending_change_count(), 5);
    let kinds: Vec<ChangeKind> = ledger.changes().iter().map(|c| c.kind).collect();
    assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Create).count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Update).count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Delete).count(), 1);

    remote.set_reachable(true);
    let report = session.service.drain_pending().await?;
    assert!(report.success);
    assert_eq!(report.created.len(), 3);
    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.deleted, vec![doomed.id.clone()]);
    assert_eq!(session.service.ledger().pending_change_count(), 0);

    assert_eq!(remote.len(), 4);
    assert_eq!(remote.get(&kept.id).map(|a| a.phase), Some(Phase::Tagging));
    for activity in &created {
        assert_eq!(session.service.sync_state(&activity.id)?, SyncState::Synced);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn partial_drain_keeps_failed_entries() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    remote.set_reachable(false);
    session.service.set_phase(&activity.id, Phase::Tagging)?;
    session.settle().await;
    assert_eq!(session.service.ledger().pending_change_count(), 1);

    let report = session.service.drain_pending().await?;
    assert!(!report.success);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn later_update_supersedes_queued_update() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    session.set_online(false);
    session.service.set_phase(&activity.id, Phase::Tagging)?;
    session.service.set_phase(&activity.id, Phase::Mapping)?;
    assert_eq!(session.service.ledger().pending_change_count(), 1);
    assert_eq!(remote.calls().patch, 0);

    session.set_online(true);
    session.service.drain_pending().await?;
    assert_eq!(remote.calls().patch, 1);
    assert_eq!(remote.get(&activity.id).map(|a| a.phase), Some(Phase::Mapping));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn offline_changes_survive_restart() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("client.db");
    let remote = InMemoryRemote::new();
    let hub = RealtimeHub::new();

    let first_id = {
        let session = TestSession::open(&path, &remote, &hub)?;
        session.set_online(false);
        let first = session.service.create(ActivityType::Mapping, titled("First"))?;
        session.service.create(ActivityType::Ranking, titled("Second"))?;
        session.service.set_phase(&first.id, Phase::Tagging)?;
        assert_eq!(session.service.ledger().pending_change_count(), 2);
        first.id
    };

    let session = TestSession::open(&path, &remote, &hub)?;
    assert_eq!(session.service.get_all()?.len(), 2);
    assert_eq!(session.service.ledger().pending_change_count(), 2);
    assert_eq!(session.service.sync_state(&first_id)?, SyncState::Local);

    let status = session.sync.sync_now().await.ok_or("sync skipped")?;
    assert_eq!(status.error, None);
    assert_eq!(status.drained, 2);
    assert_eq!(remote.len(), 2);
    assert_eq!(remote.get(&first_id).map(|a| a.phase), Some(Phase::Tagging));
    Ok(())
}

// ============================================================================
// Full reconciliation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn newer_remote_copy_wins_full_sync() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    remote.edit(&activity.id, |doc| {
        doc.phase = Phase::Tagging;
        doc.updated_at = activity.updated_at + ChronoDuration::seconds(30);
    });

    let status = session.sync.force_full_sync().await.ok_or("sync skipped")?;
    assert!(status.full_sync);
    assert_eq!(status.updated, 1);
    let local = session.service.get_local(&activity.id)?.ok_or("missing")?;
    assert_eq!(local.phase, Phase::Tagging);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn newer_local_copy_survives_full_sync() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    remote.edit(&activity.id, |doc| {
        doc.phase = Phase::Tagging;
        doc.updated_at = activity.updated_at - ChronoDuration::seconds(30);
    });

    let status = session.sync.force_full_sync().await.ok_or("sync skipped")?;
    assert_eq!(status.updated, 0);
    let local = session.service.get_local(&activity.id)?.ok_or("missing")?;
    assert_eq!(local.phase, Phase::Gathering);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_path_adopts_newer_remote_copy() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    remote.edit(&activity.id, |doc| {
        doc.phase = Phase::Tagging;
        doc.updated_at = activity.updated_at + ChronoDuration::seconds(30);
    });
    let read = session.service.get_by_id(&activity.id).await?.ok_or("missing")?;
    assert_eq!(read.phase, Phase::Tagging);
    assert_eq!(session.service.get_local(&activity.id)?, Some(read));

    remote.edit(&activity.id, |doc| {
        doc.phase = Phase::Mapping;
        doc.updated_at = activity.updated_at;
    });
    let read = session.service.get_by_id(&activity.id).await?.ok_or("missing")?;
    assert_eq!(read.phase, Phase::Tagging);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_path_falls_back_to_local_copy() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    remote.set_reachable(false);
    let read = session.service.get_by_id(&activity.id).await?;
    assert_eq!(read, Some(activity));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn full_sync_adopts_remote_only_and_drops_remotely_deleted() -> TestResult {
    let (remote, session) = session()?;
    let gone = synced(&session, "Gone").await?;
    let in_flight = session.service.create(ActivityType::Mapping, titled("In flight"))?;

    let foreign = Activity::new(
        ActivityId::generate(),
        ActivityType::Ranking,
        titled("Foreign"),
        Utc::now(),
    );
    remote.seed(foreign.clone());
    assert!(remote.purge(&gone.id));

    let status = session.sync.force_full_sync().await.ok_or("sync skipped")?;
    assert_eq!(status.created, 1);
    assert_eq!(status.deleted, 1);

    assert!(session.service.get_local(&foreign.id)?.is_some());
    assert!(session.service.get_local(&gone.id)?.is_none());
    // Still waiting on its remote create.
    assert!(session.service.get_local(&in_flight.id)?.is_some());

    session.settle().await;
    assert!(remote.get(&in_flight.id).is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn full_sync_does_not_resurrect_pending_deletes() -> TestResult {
    let (remote, session) = session()?;
    let activity = synced(&session, "Workshop").await?;

    session.set_online(false);
    session.service.delete(&activity.id)?;
    session.set_online(true);

    let status = session.sync.force_full_sync().await.ok_or("sync skipped")?;
    assert_eq!(status.error, None);
    assert_eq!(status.created, 0);
    assert!(session.service.get_local(&activity.id)?.is_none());
    assert!(remote.get(&activity.id).is_none());
    Ok(())
}

/// Answers `list` with the state from when the request arrived, half a
/// second late.
struct SlowList(InMemoryRemote);

#[async_trait]
impl RemoteApi for SlowList {
    async fn list(&self) -> Result<Vec<Versioned<Activity>>, RemoteError> {
        let snapshot = self.0.list().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        snapshot
    }

    async fn fetch(&self, id: &ActivityId) -> Result<Versioned<Activity>, RemoteError> {
        self.0.fetch(id).await
    }

    async fn insert(&self, activity: &Activity) -> Result<Versioned<Activity>, RemoteError> {
        self.0.insert(activity).await
    }

    async fn patch(
        &self,
        id: &ActivityId,
        patch: &ActivityPatch,
        if_match: Option<u64>,
    ) -> Result<Versioned<Activity>, RemoteError> {
        self.0.patch(id, patch, if_match).await
    }

    async fn remove(&self, id: &ActivityId) -> Result<(), RemoteError> {
        self.0.remove(id).await
    }
}

#[tokio::test(start_paused = true)]
async fn create_confirmed_during_full_sync_is_kept() -> TestResult {
    let remote = InMemoryRemote::new();
    let service = HybridActivityService::new(
        Box::new(MemoryKv::new()),
        Arc::new(SlowList(remote.clone())),
        Connectivity::new(true),
        test_config(),
    )?;
    let sync = SyncCoordinator::new(service.clone());

    let activity = service.create(ActivityType::Mapping, titled("Fresh"))?;
    let status = sync.force_full_sync().await.ok_or("sync skipped")?;
    service.wait_idle().await;

    assert_eq!(status.deleted, 0);
    assert!(remote.get(&activity.id).is_some());
    assert!(service.get_local(&activity.id)?.is_some());
    assert_eq!(service.sync_state(&activity.id)?, SyncState::Synced);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn full_sync_runs_once_per_window() -> TestResult {
    let (remote, session) = session()?;
    let first = session.sync.sync_now().await.ok_or("sync skipped")?;
    assert!(first.full_sync);
    let second = session.sync.sync_now().await.ok_or("sync skipped")?;
    assert!(!second.full_sync);
    assert_eq!(remote.calls().list, 1);

    tokio::time::advance(session.service.config().full_sync_window()).await;
    let third = session.sync.sync_now().await.ok_or("sync skipped")?;
    assert!(third.full_sync);
    Ok(())
}

// ============================================================================
// Duplicate tags
// ============================================================================

#[tokio::test(start_paused = true)]
async fn duplicate_tags_are_repaired_and_persisted() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("client.db");

    let mut broken = Activity::new(
        ActivityId::generate(),
        ActivityType::Mapping,
        titled("Broken"),
        Utc::now(),
    );
    let tag = Tag::new("Trust", UserId::from("alice"), "Alice", Utc::now());
    broken.tags = vec![tag.clone(), tag.clone()];
    {
        let mut cache = LocalCache::new(Box::new(SqliteKv::open(&path)?), DEFAULT_NAMESPACE);
        cache.create(broken.clone())?;
        cache.set_sync_state(&broken.id, SyncState::Local)?;
    }

    let remote = InMemoryRemote::new();
    let hub = RealtimeHub::new();
    {
        let session = TestSession::open(&path, &remote, &hub)?;
        let repaired = session.service.get_local(&broken.id)?.ok_or("missing")?;
        assert_eq!(repaired.tags.len(), 1);
        assert_eq!(repaired.tags[0].id, tag.id);
    }

    let cache = LocalCache::new(Box::new(SqliteKv::open(&path)?), DEFAULT_NAMESPACE);
    let stored = cache.get_by_id(&broken.id)?.ok_or("missing")?;
    assert_eq!(stored.tags.len(), 1);
    Ok(())
}

// ============================================================================
// Notifications and scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sync_reports_through_notifications() -> TestResult {
    let (_remote, mut session) = session()?;
    session.sync.sync_now().await.ok_or("sync skipped")?;
    let notifications = session.notifications();
    assert!(matches!(notifications.as_slice(), [Notification::SyncCompleted(status)] if status.full_sync));

    session.set_online(false);
    let status = session.sync.sync_now().await.ok_or("sync skipped")?;
    assert_eq!(status.error.as_deref(), Some("offline"));
    let notifications = session.notifications();
    assert!(matches!(notifications.as_slice(), [Notification::SyncError(_)]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_remote_is_a_sync_error_not_a_failure() -> TestResult {
    let (remote, session) = session()?;
    remote.set_reachable(false);
    let status = session.sync.force_full_sync().await.ok_or("sync skipped")?;
    assert!(status.is_error());
    assert!(status.full_sync);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn coming_back_online_triggers_a_sync() -> TestResult {
    let (remote, session) = session()?;
    session.set_online(false);
    let activity = session.service.create(ActivityType::Mapping, titled("Offline"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = session.sync.spawn(shutdown_rx);

    // Initial pass runs while offline and leaves the create queued.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(session.service.ledger().has_pending_changes());
    assert!(remote.is_empty());

    session.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!session.service.ledger().has_pending_changes());
    assert!(remote.get(&activity.id).is_some());

    shutdown_tx.send(true)?;
    handle.await?;
    Ok(())
}
