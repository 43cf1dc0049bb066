use socialmap_engine::EngineError;

use crate::TestSession;
use crate::hub::RealtimeHub;
use crate::remote::InMemoryRemote;

/// Several sessions sharing one remote store and one realtime hub.
pub struct TestNetwork {
    pub remote: InMemoryRemote,
    pub hub: RealtimeHub,
    sessions: Vec<TestSession>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            remote: InMemoryRemote::new(),
            hub: RealtimeHub::new(),
            sessions: Vec::new(),
        }
    }

    /// Add a session and connect it to the hub.
    pub async fn add_session(&mut self) -> Result<usize, EngineError> {
        let session = TestSession::new(&self.remote, &self.hub)?;
        session.connect().await;
        let index = self.sessions.len();
        self.sessions.push(session);
        Ok(index)
    }

    pub fn session(&self, index: usize) -> &TestSession {
        &self.sessions[index]
    }

    pub fn session_mut(&mut self, index: usize) -> &mut TestSession {
        &mut self.sessions[index]
    }

    /// Settle every session until no session has pending work.
    pub async fn settle_all(&self) {
        loop {
            for session in &self.sessions {
                session.service.wait_idle().await;
            }
            let mut handled = 0;
            for session in &self.sessions {
                handled += session.bridge.process_pending_signals().await;
            }
            if handled == 0 {
                break;
            }
        }
    }
}
