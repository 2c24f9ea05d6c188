//! Inbox-changed notifications.
//!
//! A single broadcast channel owned by the manager. Observers subscribe and
//! unsubscribe by dropping their receiver; emitting never blocks.

use tokio::sync::broadcast;

const BUFFER_SIZE: usize = 64;

/// Fired whenever the inbox-visible subset of messages may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxChanged;

#[derive(Debug, Clone)]
pub struct InboxNotifier {
    sender: broadcast::Sender<InboxChanged>,
}

impl InboxNotifier {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(BUFFER_SIZE).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxChanged> {
        self.sender.subscribe()
    }

    pub fn emit(&self) {
        // Nobody listening is fine.
        if self.sender.send(InboxChanged).is_err() {
            tracing::trace!(
                target: "inapp_engine::notifications::emit",
                "Inbox changed with no subscribers"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InboxNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_to_every_subscriber() {
        let notifier = InboxNotifier::new();
        let mut rx1 = notifier.subscribe();
        let mut rx2 = notifier.subscribe();

        notifier.emit();

        assert_eq!(rx1.recv().await.unwrap(), InboxChanged);
        assert_eq!(rx2.recv().await.unwrap(), InboxChanged);
    }

    #[test]
    fn emit_without_subscribers_does_not_fail() {
        let notifier = InboxNotifier::new();
        notifier.emit();
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let notifier = InboxNotifier::new();
        let rx = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(rx);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
