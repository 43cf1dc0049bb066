use std::path::Path;
use std::sync::Arc;

use socialmap_core::Notification;
use socialmap_engine::{
    Connectivity, EngineError, HybridActivityService, RealtimeBridge, SyncConfig, SyncCoordinator,
};
use socialmap_storage::{KvStore, MemoryKv, SqliteKv};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::hub::{HubTransport, RealtimeHub};
use crate::remote::InMemoryRemote;

/// Config for tests: no reconnect jitter, so paused-time runs are exact.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        reconnect_jitter_ms: 0,
        ..SyncConfig::default()
    }
}

/// One client: service, realtime bridge and sync coordinator wired to a
/// shared remote store and hub.
pub struct TestSession {
    pub service: HybridActivityService,
    pub bridge: RealtimeBridge,
    pub sync: SyncCoordinator,
    pub connectivity: Connectivity,
    pub transport: Arc<HubTransport>,
    notifications: broadcast::Receiver<Notification>,
}

impl TestSession {
    /// In-memory session. Not connected to the hub yet.
    pub fn new(remote: &InMemoryRemote, hub: &RealtimeHub) -> Result<Self, EngineError> {
        Self::with_store(Box::new(MemoryKv::new()), remote, hub, test_config())
    }

    /// Session backed by a SQLite file, for restart tests.
    pub fn open(
        path: impl AsRef<Path>,
        remote: &InMemoryRemote,
        hub: &RealtimeHub,
    ) -> Result<Self, EngineError> {
        let store = SqliteKv::open(path)?;
        Self::with_store(Box::new(store), remote, hub, test_config())
    }

    pub fn with_store(
        store: Box<dyn KvStore>,
        remote: &InMemoryRemote,
        hub: &RealtimeHub,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        let connectivity = Connectivity::new(true);
        let service =
            HybridActivityService::new(store, Arc::new(remote.clone()), connectivity.clone(), config)?;
        let (transport, signals) = hub.transport();
        let bridge = RealtimeBridge::new(service.clone(), transport.clone(), signals);
        let sync = SyncCoordinator::new(service.clone());
        let notifications = service.notifier().subscribe();
        Ok(Self {
            service,
            bridge,
            sync,
            connectivity,
            transport,
            notifications,
        })
    }

    pub fn hub_session(&self) -> usize {
        self.transport.session()
    }

    pub async fn connect(&self) -> bool {
        self.bridge.connect().await
    }

    /// Flip the client's network state without touching the realtime link.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Wait for spawned remote steps and apply every delivered realtime
    /// event, until neither produces more work.
    pub async fn settle(&self) {
        loop {
            self.service.wait_idle().await;
            if self.bridge.process_pending_signals().await == 0 {
                break;
            }
        }
    }

    /// Notifications received since the last call.
    pub fn notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        loop {
            match self.notifications.try_recv() {
                Ok(notification) => out.push(notification),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        out
    }
}
