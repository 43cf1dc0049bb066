use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socialmap_core::{ActivityId, InboundEvent, OutboundEvent, Participant};
use socialmap_engine::{RealtimeTransport, TransportError, TransportSignal};
use tokio::sync::mpsc;

struct Connection {
    signals: mpsc::UnboundedSender<TransportSignal>,
    connected: bool,
}

#[derive(Default)]
struct HubState {
    connections: Vec<Connection>,
    accepting: bool,
    presence: BTreeMap<ActivityId, Vec<Participant>>,
    emitted: Vec<(usize, OutboundEvent)>,
    connect_attempts: usize,
}

/// Simulated realtime server. Outbound events from one session are turned
/// into the matching inbound events for every other connected session.
#[derive(Clone)]
pub struct RealtimeHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                accepting: true,
                ..Default::default()
            })),
        }
    }

    /// Register a new session and hand back its transport and signal stream.
    pub fn transport(&self) -> (Arc<HubTransport>, mpsc::UnboundedReceiver<TransportSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let session = state.connections.len();
        state.connections.push(Connection {
            signals: tx,
            connected: false,
        });
        let transport = Arc::new(HubTransport {
            hub: self.clone(),
            session,
        });
        (transport, rx)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().accepting = accepting;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn is_connected(&self, session: usize) -> bool {
        self.state
            .lock()
            .connections
            .get(session)
            .is_some_and(|c| c.connected)
    }

    /// Drop every live connection, as a server restart would.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        for connection in state.connections.iter_mut().filter(|c| c.connected) {
            connection.connected = false;
            let _ = connection.signals.send(TransportSignal::Disconnected);
        }
    }

    /// Deliver an event straight to one session, bypassing translation.
    pub fn deliver(&self, session: usize, event: InboundEvent) {
        let state = self.state.lock();
        if let Some(connection) = state.connections.get(session) {
            let _ = connection.signals.send(TransportSignal::Inbound(event));
        }
    }

    /// Every event a session emitted, in order.
    pub fn emitted_by(&self, session: usize) -> Vec<OutboundEvent> {
        self.state
            .lock()
            .emitted
            .iter()
            .filter(|(from, _)| *from == session)
            .map(|(_, event)| event.clone())
            .collect()
    }

    fn broadcast(&self, from: usize, event: &OutboundEvent) {
        let mut state = self.state.lock();
        state.emitted.push((from, event.clone()));
        let inbound = translate(&mut state.presence, event);
        for (session, connection) in state.connections.iter().enumerate() {
            if session != from && connection.connected {
                let _ = connection
                    .signals
                    .send(TransportSignal::Inbound(inbound.clone()));
            }
        }
    }
}

fn translate(
    presence: &mut BTreeMap<ActivityId, Vec<Participant>>,
    event: &OutboundEvent,
) -> InboundEvent {
    match event.clone() {
        OutboundEvent::JoinActivity {
            activity_id,
            participant,
        } => {
            let roster = presence.entry(activity_id.clone()).or_default();
            match roster.iter_mut().find(|p| p.id == participant.id) {
                Some(existing) => existing.is_connected = true,
                None => roster.push(participant),
            }
            InboundEvent::ParticipantsUpdated {
                activity_id,
                participants: roster.clone(),
            }
        }
        OutboundEvent::LeaveActivity { activity_id, user_id } => {
            let roster = presence.entry(activity_id.clone()).or_default();
            for participant in roster.iter_mut().filter(|p| p.id == user_id) {
                participant.is_connected = false;
            }
            InboundEvent::ParticipantsUpdated {
                activity_id,
                participants: roster.clone(),
            }
        }
        OutboundEvent::AddTag { activity_id, tag } => InboundEvent::TagAdded { activity_id, tag },
        OutboundEvent::VoteTag {
            activity_id,
            tag_id,
            votes,
            ..
        } => InboundEvent::TagVoted {
            activity_id,
            tag_id,
            votes: Some(votes),
        },
        OutboundEvent::DeleteTag { activity_id, tag_id } => InboundEvent::TagDeleted { activity_id, tag_id },
        OutboundEvent::UpdateMapping { activity_id, mapping } => {
            InboundEvent::MappingUpdated { activity_id, mapping }
        }
        OutboundEvent::ChangePhase { activity_id, phase } => InboundEvent::PhaseChanged { activity_id, phase },
        OutboundEvent::CreateActivity { activity } => InboundEvent::ActivityCreated { activity },
        OutboundEvent::UpdateActivity { activity } => InboundEvent::ActivityUpdated {
            activity_id: activity.id.clone(),
            activity: Some(activity),
        },
        OutboundEvent::DeleteActivity { activity_id } => InboundEvent::ActivityDeleted { activity_id },
    }
}

pub struct HubTransport {
    hub: RealtimeHub,
    session: usize,
}

impl HubTransport {
    pub fn session(&self) -> usize {
        self.session
    }
}

#[async_trait]
impl RealtimeTransport for HubTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.connect_attempts += 1;
        if !state.accepting {
            return Err(TransportError::ConnectFailed("server unavailable".into()));
        }
        if let Some(connection) = state.connections.get_mut(self.session) {
            connection.connected = true;
        }
        Ok(())
    }

    fn emit(&self, event: &OutboundEvent) -> Result<(), TransportError> {
        if !self.hub.is_connected(self.session) {
            return Err(TransportError::NotConnected);
        }
        self.hub.broadcast(self.session, event);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.hub.state.lock();
        if let Some(connection) = state.connections.get_mut(self.session) {
            connection.connected = false;
        }
    }
}
