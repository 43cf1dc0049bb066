//! Realtime channel between sessions.
//!
//! Outbound events go through [`EventChannel`], which queues them while the
//! transport is down and flushes in order on reconnect. [`RealtimeBridge`]
//! owns the connection lifecycle and applies inbound events to the local
//! cache. Inbound handling is idempotent: events are refresh hints and may
//! arrive twice or not at all.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use socialmap_core::approval::apply_tag_approval;
use socialmap_core::merge::reconcile_presence;
use socialmap_core::{Activity, ActivityId, InboundEvent, Notification, OutboundEvent, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::service::{EventPublisher, HybridActivityService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection gave up or the client went offline. Outbound events are
    /// queued until an explicit reconnect.
    OfflineMode,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::OfflineMode => "offline mode",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// What the transport reports back, delivered over an mpsc channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Disconnected,
    Inbound(InboundEvent),
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    fn emit(&self, event: &OutboundEvent) -> Result<(), TransportError>;

    async fn close(&self);
}

// ============================================================================
// Outbound
// ============================================================================

pub struct EventChannel {
    transport: Arc<dyn RealtimeTransport>,
    status: watch::Sender<ConnectionStatus>,
    queue: Mutex<VecDeque<OutboundEvent>>,
    last_join: Mutex<Option<OutboundEvent>>,
}

impl EventChannel {
    fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            transport,
            status,
            queue: Mutex::new(VecDeque::new()),
            last_join: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(status = %next, "realtime status changed");
        }
    }

    /// Emit now when connected, otherwise queue in memory. A failed emit is
    /// queued as well.
    pub fn send_message(&self, event: OutboundEvent) {
        match &event {
            OutboundEvent::JoinActivity { .. } => *self.last_join.lock() = Some(event.clone()),
            OutboundEvent::LeaveActivity { activity_id, .. } => {
                let mut last_join = self.last_join.lock();
                if last_join.as_ref().is_some_and(|join| join.activity_id() == activity_id) {
                    *last_join = None;
                }
            }
            _ => {}
        }

        if self.status() == ConnectionStatus::Connected {
            match self.transport.emit(&event) {
                Ok(()) => return,
                Err(e) => warn!(event = event.name(), error = %e, "emit failed, queueing"),
            }
        }
        debug!(event = event.name(), "queueing outbound event");
        self.queue.lock().push_back(event);
    }

    /// Send queued events in order. Stops at the first failure and keeps the
    /// rest.
    fn flush(&self) -> usize {
        let mut sent = 0;
        loop {
            let Some(event) = self.queue.lock().pop_front() else {
                break;
            };
            if let Err(e) = self.transport.emit(&event) {
                warn!(event = event.name(), error = %e, "flush interrupted");
                self.queue.lock().push_front(event);
                break;
            }
            sent += 1;
        }
        sent
    }

    fn rejoin(&self) {
        let join = self.last_join.lock().clone();
        if let Some(join) = join {
            if let Err(e) = self.transport.emit(&join) {
                warn!(error = %e, "rejoin failed");
            }
        }
    }
}

impl EventPublisher for EventChannel {
    fn publish(&self, event: OutboundEvent) {
        self.send_message(event);
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Clone)]
pub struct RealtimeBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    service: HybridActivityService,
    channel: Arc<EventChannel>,
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportSignal>>,
    attempts: AtomicU32,
    reconnecting: AtomicBool,
}

/// RAII guard to reset the reconnecting flag.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RealtimeBridge {
    /// Attach to `service` as its event publisher.
    pub fn new(
        service: HybridActivityService,
        transport: Arc<dyn RealtimeTransport>,
        signals: mpsc::UnboundedReceiver<TransportSignal>,
    ) -> Self {
        let channel = Arc::new(EventChannel::new(transport));
        service.set_publisher(channel.clone());
        Self {
            inner: Arc::new(BridgeInner {
                service,
                channel,
                signals: tokio::sync::Mutex::new(signals),
                attempts: AtomicU32::new(0),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.channel.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.channel.status.subscribe()
    }

    pub fn queued(&self) -> usize {
        self.inner.channel.queued()
    }

    pub fn send_message(&self, event: OutboundEvent) {
        self.inner.channel.send_message(event);
    }

    fn service(&self) -> &HybridActivityService {
        &self.inner.service
    }

    fn notify(&self, notification: Notification) {
        self.service().notifier().emit(notification);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// One connection attempt. On success, queued events are flushed before
    /// the last join is re-sent.
    pub async fn connect(&self) -> bool {
        let channel = &self.inner.channel;
        channel.set_status(ConnectionStatus::Connecting);
        match channel.transport.connect().await {
            Ok(()) => {
                channel.set_status(ConnectionStatus::Connected);
                self.inner.attempts.store(0, Ordering::Release);
                let flushed = channel.flush();
                channel.rejoin();
                info!(flushed, "realtime connected");
                true
            }
            Err(e) => {
                warn!(error = %e, "realtime connect failed");
                channel.set_status(ConnectionStatus::Disconnected);
                false
            }
        }
    }

    /// Retry with linear backoff plus jitter until connected or out of
    /// attempts, then fall back to offline mode.
    pub async fn reconnect(&self) -> ConnectionStatus {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return self.status();
        }
        let _guard = ReconnectGuard(&self.inner.reconnecting);

        let config = self.service().config().clone();
        while self.status() != ConnectionStatus::Connected {
            if !self.service().is_online() {
                self.inner.channel.set_status(ConnectionStatus::OfflineMode);
                break;
            }
            let attempt = self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            if attempt > config.max_reconnect_attempts {
                warn!(attempts = attempt - 1, "reconnection exhausted, entering offline mode");
                self.inner.channel.set_status(ConnectionStatus::OfflineMode);
                break;
            }
            debug!(attempt, "reconnecting");
            if self.connect().await {
                break;
            }
            if attempt >= config.max_reconnect_attempts {
                warn!(attempts = attempt, "reconnection exhausted, entering offline mode");
                self.inner.channel.set_status(ConnectionStatus::OfflineMode);
                break;
            }
            let jitter = rand::thread_rng().gen_range(0..=config.reconnect_jitter_ms);
            let delay = config.reconnect_delay() * attempt + std::time::Duration::from_millis(jitter);
            tokio::time::sleep(delay).await;
        }
        self.status()
    }

    /// Follow the client's network state. Going online resets the attempt
    /// counter and reconnects; going offline closes the transport.
    pub async fn set_online(&self, online: bool) {
        self.service().connectivity().set_online(online);
        if online {
            self.inner.attempts.store(0, Ordering::Release);
            self.reconnect().await;
        } else {
            self.inner.channel.transport.close().await;
            self.inner.channel.set_status(ConnectionStatus::OfflineMode);
        }
    }

    /// A page becoming visible again retries a dropped connection.
    pub async fn on_visibility_change(&self, visible: bool) {
        if visible && self.status() != ConnectionStatus::Connected {
            self.inner.attempts.store(0, Ordering::Release);
            self.reconnect().await;
        }
    }

    pub async fn disconnect(&self) {
        self.inner.channel.transport.close().await;
        self.inner.channel.set_status(ConnectionStatus::Disconnected);
    }

    /// Join through the service, which records the participant and publishes
    /// the join. The join is re-sent after every reconnect.
    pub fn join_activity(&self, id: &ActivityId, user_id: &UserId, name: &str) -> Result<Activity, EngineError> {
        self.service().add_participant(id, user_id, name)
    }

    pub fn leave_activity(&self, id: &ActivityId, user_id: &UserId) -> Result<Activity, EngineError> {
        self.service().set_participant_connected(id, user_id, false)
    }

    /// Consume transport signals until shutdown or until the transport drops
    /// its sender.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut signals = self.inner.signals.lock().await;
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("realtime bridge stopped");
    }

    /// Handle every signal already delivered, without waiting for more.
    /// Returns 0 while `run` owns the receiver.
    pub async fn process_pending_signals(&self) -> usize {
        let Ok(mut signals) = self.inner.signals.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(signal) = signals.try_recv() {
            self.handle_signal(signal).await;
            handled += 1;
        }
        handled
    }

    async fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Disconnected => {
                self.inner.channel.set_status(ConnectionStatus::Disconnected);
                if self.service().is_online() {
                    self.reconnect().await;
                }
            }
            TransportSignal::Inbound(event) => {
                let name = event.name();
                if let Err(e) = self.handle_inbound(event).await {
                    warn!(event = name, error = %e, "failed to apply inbound event");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub async fn handle_inbound(&self, event: InboundEvent) -> Result<(), EngineError> {
        debug!(event = event.name(), activity = %event.activity_id(), "inbound event");
        let service = self.service();
        match event {
            InboundEvent::ActivityCreated { activity } => {
                let activity_id = activity.id.clone();
                if service.apply_remote_created(activity)? {
                    self.notify(Notification::ActivityUpdated { activity_id });
                }
            }
            InboundEvent::ActivityUpdated { activity_id, activity } => {
                match activity {
                    Some(activity) => {
                        service.adopt_remote(activity)?;
                    }
                    None => {
                        service.get_by_id(&activity_id).await?;
                    }
                }
                self.notify(Notification::ActivityUpdated { activity_id });
            }
            InboundEvent::TagAdded { activity_id, tag } => {
                let tag_id = tag.id.clone();
                let applied = service.apply_inbound(&activity_id, |activity| {
                    if activity.tag(&tag.id).is_some() {
                        return false;
                    }
                    activity.tags.push(tag);
                    apply_tag_approval(&mut activity.tags, &activity.settings.tag_creation.voting);
                    true
                })?;
                if applied == Some(false) {
                    debug!(activity = %activity_id, tag = %tag_id, "tag already present");
                }
                self.notify(Notification::TagAdded { activity_id, tag_id });
            }
            InboundEvent::TagVoted {
                activity_id,
                tag_id,
                votes,
            } => {
                match votes {
                    Some(votes) => {
                        service.apply_inbound(&activity_id, |activity| {
                            let Some(tag) = activity.tag_mut(&tag_id) else {
                                return false;
                            };
                            if tag.votes == votes {
                                return false;
                            }
                            tag.votes = votes;
                            apply_tag_approval(&mut activity.tags, &activity.settings.tag_creation.voting);
                            true
                        })?;
                    }
                    None => {
                        service.get_by_id(&activity_id).await?;
                    }
                }
                self.notify(Notification::TagVoted { activity_id, tag_id });
            }
            InboundEvent::TagDeleted { activity_id, tag_id } => {
                service.apply_inbound(&activity_id, |activity| {
                    let before = activity.tags.len();
                    activity.tags.retain(|t| t.id != tag_id);
                    if activity.tags.len() == before {
                        return false;
                    }
                    for mapping in activity.mappings.iter_mut() {
                        mapping.positions.retain(|p| p.tag_id != tag_id);
                    }
                    for ranking in activity.rankings.iter_mut() {
                        ranking.tag_ids.retain(|t| t != &tag_id);
                    }
                    true
                })?;
                self.notify(Notification::TagDeleted { activity_id, tag_id });
            }
            InboundEvent::MappingUpdated { activity_id, mapping } => {
                let user_id = mapping.user_id.clone();
                service.apply_inbound(&activity_id, |activity| {
                    match activity.mappings.iter_mut().find(|m| m.user_id == mapping.user_id) {
                        Some(slot) if *slot == mapping => false,
                        Some(slot) => {
                            *slot = mapping;
                            true
                        }
                        None => {
                            activity.mappings.push(mapping);
                            true
                        }
                    }
                })?;
                self.notify(Notification::MappingUpdated { activity_id, user_id });
            }
            InboundEvent::PhaseChanged { activity_id, phase } => {
                service.apply_inbound(&activity_id, |activity| {
                    if activity.phase == phase || !phase.is_valid_for(activity.activity_type) {
                        return false;
                    }
                    activity.phase = phase;
                    true
                })?;
                self.notify(Notification::PhaseChanged { activity_id, phase });
            }
            InboundEvent::ParticipantsUpdated {
                activity_id,
                participants,
            } => {
                service.apply_inbound(&activity_id, |activity| {
                    let reconciled = reconcile_presence(&activity.participants, &participants);
                    if reconciled == activity.participants {
                        return false;
                    }
                    activity.participants = reconciled;
                    true
                })?;
                self.notify(Notification::ParticipantsUpdated { activity_id });
            }
            InboundEvent::ActivityDeleted { activity_id } => {
                service.apply_remote_deleted(&activity_id)?;
                self.notify(Notification::ActivityDeleted { activity_id });
            }
        }
        Ok(())
    }
}
