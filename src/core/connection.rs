// Lazily established, shared store connection plus its connectivity event registry.
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::core::error::Error;
use crate::core::notify::{ConnectivityEvents, RestoreListener};
use crate::core::store::{Connector, Store};

pub struct ConnectionHandle {
    connector: Box<dyn Connector>,
    store: OnceCell<Arc<dyn Store>>,
    events: ConnectivityEvents,
}

impl ConnectionHandle {
    pub fn new(connector: impl Connector + 'static, restore_capacity: usize) -> Self {
        Self {
            connector: Box::new(connector),
            store: OnceCell::new(),
            events: ConnectivityEvents::new(restore_capacity),
        }
    }

    /// The connection, dialing it on first use. A failed dial is retried by the next caller.
    pub async fn store(&self) -> Result<Arc<dyn Store>, Error> {
        let store = self
            .store
            .get_or_try_init(|| async {
                let store = self.connector.connect(self.events.notifier()).await?;
                tracing::debug!(endpoint = %store.endpoint(), "store connection established");
                Ok::<_, Error>(store)
            })
            .await?;
        Ok(store.clone())
    }

    pub fn is_established(&self) -> bool {
        self.store.initialized()
    }

    /// Live transport state; dials the connection if it has not been used yet.
    pub async fn is_connected(&self) -> bool {
        match self.store().await {
            Ok(store) => store.is_connected(),
            Err(err) => {
                tracing::debug!(error = %err, "store connection unavailable");
                false
            }
        }
    }

    pub fn on_connection_restored(&self) -> RestoreListener {
        self.events.listen()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("established", &self.is_established())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionHandle;
    use crate::core::error::ErrorKind;
    use crate::core::memory::MemoryStore;
    use crate::core::notify::DEFAULT_RESTORE_CAPACITY;

    #[tokio::test]
    async fn connects_lazily_once() {
        let memory = MemoryStore::new();
        let handle = ConnectionHandle::new(memory.clone(), DEFAULT_RESTORE_CAPACITY);
        assert!(!handle.is_established());
        let first = handle.store().await.expect("store");
        let second = handle.store().await.expect("store");
        assert!(handle.is_established());
        assert_eq!(first.endpoint(), second.endpoint());
    }

    #[tokio::test]
    async fn failed_dial_is_retried() {
        let memory = MemoryStore::new();
        memory.refuse_connections(true);
        let handle = ConnectionHandle::new(memory.clone(), DEFAULT_RESTORE_CAPACITY);
        let Err(err) = handle.store().await else {
            panic!("expected the dial to be refused");
        };
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(!handle.is_connected().await);

        memory.refuse_connections(false);
        assert!(handle.is_connected().await);
    }

    #[tokio::test]
    async fn reconnect_reaches_listeners() {
        let memory = MemoryStore::new();
        let handle = ConnectionHandle::new(memory.clone(), DEFAULT_RESTORE_CAPACITY);
        let mut listener = handle.on_connection_restored();
        handle.store().await.expect("store");

        memory.disconnect();
        assert!(!handle.is_connected().await);
        memory.reconnect();
        let event = listener.recv().await.expect("event");
        assert_eq!(event.reconnects, 1);
        assert!(handle.is_connected().await);
    }
}
