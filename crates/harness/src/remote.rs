use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socialmap_core::{Activity, ActivityId, ActivityPatch};
use socialmap_engine::{RemoteApi, RemoteError, Versioned};

/// Per-method call counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub fetch: usize,
    pub insert: usize,
    pub patch: usize,
    pub remove: usize,
}

impl CallCounts {
    pub fn writes(&self) -> usize {
        self.insert + self.patch + self.remove
    }
}

#[derive(Debug)]
struct RemoteState {
    docs: BTreeMap<ActivityId, Versioned<Activity>>,
    reachable: bool,
    forced_conflicts: u32,
    calls: CallCounts,
}

/// Simulated remote document store with versioned conditional writes.
/// Clones share state, so a test can hold one while sessions hold others.
#[derive(Debug, Clone)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                docs: BTreeMap::new(),
                reachable: true,
                forced_conflicts: 0,
                calls: CallCounts::default(),
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls = CallCounts::default();
    }

    /// The next `n` conditional patches fail as if another writer got there
    /// first. Each one bumps the stored version.
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().forced_conflicts = n;
    }

    pub fn get(&self, id: &ActivityId) -> Option<Activity> {
        self.state.lock().docs.get(id).map(|v| v.document.clone())
    }

    pub fn version(&self, id: &ActivityId) -> Option<u64> {
        self.state.lock().docs.get(id).map(|v| v.version)
    }

    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a document directly, as another client would have.
    pub fn seed(&self, activity: Activity) {
        let mut state = self.state.lock();
        let version = state.docs.get(&activity.id).map_or(1, |v| v.version + 1);
        state.docs.insert(
            activity.id.clone(),
            Versioned {
                version,
                document: activity,
            },
        );
    }

    /// Edit a stored document server-side, bumping its version.
    pub fn edit<F>(&self, id: &ActivityId, f: F) -> bool
    where
        F: FnOnce(&mut Activity),
    {
        let mut state = self.state.lock();
        match state.docs.get_mut(id) {
            Some(versioned) => {
                f(&mut versioned.document);
                versioned.version += 1;
                true
            }
            None => false,
        }
    }

    /// Delete server-side without going through a client.
    pub fn purge(&self, id: &ActivityId) -> bool {
        self.state.lock().docs.remove(id).is_some()
    }

    fn guard(state: &RemoteState) -> Result<(), RemoteError> {
        if state.reachable {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("connection refused".into()))
        }
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn list(&self) -> Result<Vec<Versioned<Activity>>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.list += 1;
        Self::guard(&state)?;
        Ok(state.docs.values().cloned().collect())
    }

    async fn fetch(&self, id: &ActivityId) -> Result<Versioned<Activity>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.fetch += 1;
        Self::guard(&state)?;
        state.docs.get(id).cloned().ok_or(RemoteError::NotFound)
    }

    async fn insert(&self, activity: &Activity) -> Result<Versioned<Activity>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.insert += 1;
        Self::guard(&state)?;
        if state.docs.contains_key(&activity.id) {
            return Err(RemoteError::AlreadyExists);
        }
        let versioned = Versioned {
            version: 1,
            document: activity.clone(),
        };
        state.docs.insert(activity.id.clone(), versioned.clone());
        Ok(versioned)
    }

    async fn patch(
        &self,
        id: &ActivityId,
        patch: &ActivityPatch,
        if_match: Option<u64>,
    ) -> Result<Versioned<Activity>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.patch += 1;
        Self::guard(&state)?;
        let forced = if_match.is_some() && state.forced_conflicts > 0;
        if forced {
            state.forced_conflicts -= 1;
        }
        let versioned = state.docs.get_mut(id).ok_or(RemoteError::NotFound)?;
        if forced {
            versioned.version += 1;
        }
        if let Some(expected) = if_match {
            if expected != versioned.version {
                return Err(RemoteError::Conflict {
                    expected,
                    current: versioned.version,
                });
            }
        }
        patch.apply_to(&mut versioned.document);
        versioned.version += 1;
        Ok(versioned.clone())
    }

    async fn remove(&self, id: &ActivityId) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.remove += 1;
        Self::guard(&state)?;
        state.docs.remove(id).map(|_| ()).ok_or(RemoteError::NotFound)
    }
}
