//! Request/response access to the remote document store.
//!
//! `RemoteApi` is the transport boundary. `RemoteStoreClient` wraps it with
//! sanitization, optimistic-concurrency retries and the create/update
//! fallbacks that make replaying queued changes safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socialmap_core::merge::merge_participants;
use socialmap_core::sanitize::{sanitize_activity, sanitize_patch};
use socialmap_core::{Activity, ActivityId, ActivityPatch};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A document together with the store's version counter, the value a
/// conditional write must match.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub document: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("document not found")]
    NotFound,

    #[error("version conflict: expected {expected}, current {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("document already exists")]
    AlreadyExists,

    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list(&self) -> Result<Vec<Versioned<Activity>>, RemoteError>;

    async fn fetch(&self, id: &ActivityId) -> Result<Versioned<Activity>, RemoteError>;

    async fn insert(&self, activity: &Activity) -> Result<Versioned<Activity>, RemoteError>;

    /// Apply the allow-listed fields. With `if_match`, the write succeeds only
    /// if the stored version still equals it.
    async fn patch(
        &self,
        id: &ActivityId,
        patch: &ActivityPatch,
        if_match: Option<u64>,
    ) -> Result<Versioned<Activity>, RemoteError>;

    async fn remove(&self, id: &ActivityId) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(Activity),
    /// Conflict retries ran out; carries the latest remote copy.
    Stale(Activity),
}

impl UpdateOutcome {
    pub fn applied(self) -> Option<Activity> {
        match self {
            Self::Applied(activity) => Some(activity),
            Self::Stale(_) => None,
        }
    }
}

enum PatchFailure {
    NotFound,
    Stale(Activity),
    Failed,
}

pub struct RemoteStoreClient {
    api: Arc<dyn RemoteApi>,
    versions: Mutex<HashMap<ActivityId, u64>>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl RemoteStoreClient {
    pub fn new(api: Arc<dyn RemoteApi>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            api,
            versions: Mutex::new(HashMap::new()),
            max_retries,
            retry_backoff,
        }
    }

    pub fn known_version(&self, id: &ActivityId) -> Option<u64> {
        self.versions.lock().get(id).copied()
    }

    fn record(&self, versioned: Versioned<Activity>) -> Activity {
        self.versions
            .lock()
            .insert(versioned.document.id.clone(), versioned.version);
        versioned.document
    }

    fn forget(&self, id: &ActivityId) {
        self.versions.lock().remove(id);
    }

    pub async fn get_activities(&self) -> Option<Vec<Activity>> {
        match self.api.list().await {
            Ok(list) => Some(list.into_iter().map(|v| self.record(v)).collect()),
            Err(e) => {
                warn!(error = %e, "failed to list remote activities");
                None
            }
        }
    }

    pub async fn get_activity_by_id(&self, id: &ActivityId) -> Option<Activity> {
        match self.api.fetch(id).await {
            Ok(versioned) => Some(self.record(versioned)),
            Err(RemoteError::NotFound) => {
                debug!(id = %id, "remote activity not found");
                self.forget(id);
                None
            }
            Err(e) => {
                warn!(id = %id, error = %e, "failed to fetch remote activity");
                None
            }
        }
    }

    /// Create the document remotely. A create whose earlier response was lost
    /// finds the document already there and becomes an update.
    pub async fn create_activity(&self, activity: &Activity) -> Option<Activity> {
        let mut doc = activity.clone();
        sanitize_activity(&mut doc);
        match self.api.insert(&doc).await {
            Ok(versioned) => {
                info!(id = %doc.id, version = versioned.version, "created remote activity");
                Some(self.record(versioned))
            }
            Err(RemoteError::AlreadyExists) => {
                debug!(id = %doc.id, "remote activity already exists, updating instead");
                let patch = ActivityPatch::from_activity(&doc);
                self.patch_with_retries(&doc.id, patch, self.max_retries)
                    .await
                    .ok()
            }
            Err(e) => {
                warn!(id = %doc.id, error = %e, "remote create failed");
                None
            }
        }
    }

    pub async fn update_activity(&self, activity: &Activity) -> Option<UpdateOutcome> {
        self.update_activity_with_retries(activity, self.max_retries).await
    }

    /// Conditional update of the allow-listed fields of `activity`. If the
    /// store no longer holds the document, the whole local copy is created
    /// instead, keeping its type and creation time.
    pub async fn update_activity_with_retries(
        &self,
        activity: &Activity,
        max_retries: u32,
    ) -> Option<UpdateOutcome> {
        let id = &activity.id;
        let patch = ActivityPatch::from_activity(activity);
        match self.patch_with_retries(id, patch, max_retries).await {
            Ok(activity) => Some(UpdateOutcome::Applied(activity)),
            Err(PatchFailure::Stale(latest)) => Some(UpdateOutcome::Stale(latest)),
            Err(PatchFailure::Failed) => None,
            Err(PatchFailure::NotFound) => {
                info!(id = %id, "update target missing remotely, creating it");
                let mut doc = activity.clone();
                sanitize_activity(&mut doc);
                match self.api.insert(&doc).await {
                    Ok(versioned) => Some(UpdateOutcome::Applied(self.record(versioned))),
                    Err(e) => {
                        warn!(id = %id, error = %e, "create fallback failed");
                        None
                    }
                }
            }
        }
    }

    async fn patch_with_retries(
        &self,
        id: &ActivityId,
        mut patch: ActivityPatch,
        max_retries: u32,
    ) -> Result<Activity, PatchFailure> {
        sanitize_patch(&mut patch);
        let mut attempt = 0;
        loop {
            let if_match = self.known_version(id);
            match self.api.patch(id, &patch, if_match).await {
                Ok(versioned) => return Ok(self.record(versioned)),
                Err(RemoteError::NotFound) => {
                    self.forget(id);
                    return Err(PatchFailure::NotFound);
                }
                Err(RemoteError::Conflict { expected, current }) => {
                    attempt += 1;
                    if attempt > max_retries {
                        warn!(id = %id, attempts = attempt, "conflict retries exhausted");
                        return match self.get_activity_by_id(id).await {
                            Some(latest) => Err(PatchFailure::Stale(latest)),
                            None => Err(PatchFailure::Failed),
                        };
                    }
                    debug!(id = %id, expected, current, attempt, "version conflict, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    let latest = match self.api.fetch(id).await {
                        Ok(versioned) => self.record(versioned),
                        Err(RemoteError::NotFound) => {
                            self.forget(id);
                            return Err(PatchFailure::NotFound);
                        }
                        Err(e) => {
                            warn!(id = %id, error = %e, "refetch after conflict failed");
                            return Err(PatchFailure::Failed);
                        }
                    };
                    if let Some(incoming) = patch.participants.take() {
                        patch.participants = Some(merge_participants(&latest.participants, &incoming));
                    }
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "remote update failed");
                    return Err(PatchFailure::Failed);
                }
            }
        }
    }

    /// Deleting a document that is already gone counts as success.
    pub async fn delete_activity(&self, id: &ActivityId) -> bool {
        match self.api.remove(id).await {
            Ok(()) | Err(RemoteError::NotFound) => {
                self.forget(id);
                info!(id = %id, "deleted remote activity");
                true
            }
            Err(e) => {
                warn!(id = %id, error = %e, "remote delete failed");
                false
            }
        }
    }
}
