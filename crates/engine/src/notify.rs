use socialmap_core::Notification;
use tokio::sync::broadcast;

/// Broadcast bus for presentation-layer notifications. Each subscriber gets
/// its own stream; with no subscribers, notifications are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, notification: Notification) {
        tracing::debug!(
            event = notification.name(),
            subscriber_count = self.tx.receiver_count(),
            "notify"
        );
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socialmap_core::ActivityId;

    #[test]
    fn emit_without_subscribers_is_dropped() {
        let notifier = Notifier::new(4);
        notifier.emit(Notification::ActivityDeleted {
            activity_id: ActivityId::from("a-1"),
        });
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_receive_independently() {
        let notifier = Notifier::new(4);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        notifier.emit(Notification::ParticipantsUpdated {
            activity_id: ActivityId::from("a-1"),
        });
        assert_eq!(first.try_recv().unwrap().name(), "participants_updated");
        assert_eq!(second.try_recv().unwrap().name(), "participants_updated");
        assert!(first.try_recv().is_err());
    }
}
