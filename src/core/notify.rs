//! Purpose: Fan out connectivity-restored events from a store connection to listeners.
//! Exports: `ConnectionRestored`, `RestoreNotifier`, `RestoreListener`, `ConnectivityEvents`.
//! Role: Observer registry owned by the connection handle; stores only hold a notifier.
//! Invariants: Dispatch is fire-and-forget through a bounded queue; a slow listener skips
//! Invariants: old events instead of growing memory. No ordering between listeners.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const DEFAULT_RESTORE_CAPACITY: usize = 16;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionRestored {
    pub endpoint: String,
    pub reconnects: u64,
}

#[derive(Clone, Debug)]
pub struct RestoreNotifier {
    tx: broadcast::Sender<ConnectionRestored>,
}

impl RestoreNotifier {
    /// Returns how many listeners were handed the event.
    pub fn notify(&self, event: ConnectionRestored) -> usize {
        tracing::info!(
            endpoint = %event.endpoint,
            reconnects = event.reconnects,
            "store connection restored"
        );
        self.tx.send(event).unwrap_or(0)
    }
}

pub struct RestoreListener {
    rx: broadcast::Receiver<ConnectionRestored>,
}

impl RestoreListener {
    /// Next event, or `None` once the handle and every notifier are gone.
    pub async fn recv(&mut self) -> Option<ConnectionRestored> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "restore listener lagged; dropping old events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug)]
pub struct ConnectivityEvents {
    tx: broadcast::Sender<ConnectionRestored>,
}

impl ConnectivityEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notifier(&self) -> RestoreNotifier {
        RestoreNotifier {
            tx: self.tx.clone(),
        }
    }

    pub fn listen(&self) -> RestoreListener {
        RestoreListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ConnectivityEvents {
    fn default() -> Self {
        Self::new(DEFAULT_RESTORE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionRestored, ConnectivityEvents};

    fn event(reconnects: u64) -> ConnectionRestored {
        ConnectionRestored {
            endpoint: "memory".to_string(),
            reconnects,
        }
    }

    #[tokio::test]
    async fn every_listener_sees_the_event() {
        let events = ConnectivityEvents::default();
        let mut first = events.listen();
        let mut second = events.listen();
        assert_eq!(events.listener_count(), 2);

        let delivered = events.notifier().notify(event(1));
        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await, Some(event(1)));
        assert_eq!(second.recv().await, Some(event(1)));
    }

    #[test]
    fn notify_without_listeners_is_fine() {
        let events = ConnectivityEvents::default();
        assert_eq!(events.notifier().notify(event(1)), 0);
    }

    #[tokio::test]
    async fn lagging_listener_skips_to_recent_events() {
        let events = ConnectivityEvents::new(2);
        let mut listener = events.listen();
        let notifier = events.notifier();
        for n in 1..=5 {
            notifier.notify(event(n));
        }
        assert_eq!(listener.recv().await, Some(event(4)));
        assert_eq!(listener.recv().await, Some(event(5)));
    }

    #[tokio::test]
    async fn listener_ends_when_events_dropped() {
        let events = ConnectivityEvents::default();
        let mut listener = events.listen();
        drop(events);
        assert_eq!(listener.recv().await, None);
    }
}
