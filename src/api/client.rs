//! Purpose: Define the client that owns one store connection and one codec.
//! Exports: `Client`, `ClientOptions`, `ApiResult`.
//! Role: Shared entry point; every capability trait in `api` is implemented on `Client`.
//! Invariants: The connection is dialed lazily on first use and shared by all clones.
//! Invariants: No ambient state; callers construct and pass clients explicitly.

use std::fmt;
use std::sync::Arc;

use crate::core::codec::{Codec, JsonCodec};
use crate::core::connection::ConnectionHandle;
use crate::core::error::{Error, ErrorKind};
use crate::core::notify::{DEFAULT_RESTORE_CAPACITY, RestoreListener};
use crate::core::store::{Connector, Store};

pub type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Keys requested per server-side scan page.
    pub scan_page_size: usize,
    /// Queue depth for connectivity-restored events per listener.
    pub restore_capacity: usize,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self {
            scan_page_size: 250,
            restore_capacity: DEFAULT_RESTORE_CAPACITY,
        }
    }

    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    pub fn with_restore_capacity(mut self, capacity: usize) -> Self {
        self.restore_capacity = capacity;
        self
    }

    fn validate(&self) -> ApiResult<()> {
        if self.scan_page_size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("scan page size must be greater than zero"));
        }
        if self.restore_capacity == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("restore capacity must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Client<C: Codec = JsonCodec> {
    inner: Arc<ClientInner<C>>,
}

struct ClientInner<C> {
    connection: ConnectionHandle,
    codec: C,
    options: ClientOptions,
}

impl Client<JsonCodec> {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::build(connector, JsonCodec, ClientOptions::new())
    }

    pub fn with_options(
        connector: impl Connector + 'static,
        options: ClientOptions,
    ) -> ApiResult<Self> {
        options.validate()?;
        Ok(Self::build(connector, JsonCodec, options))
    }
}

impl<C: Codec> Client<C> {
    pub fn with_codec(
        connector: impl Connector + 'static,
        codec: C,
        options: ClientOptions,
    ) -> ApiResult<Self> {
        options.validate()?;
        Ok(Self::build(connector, codec, options))
    }

    fn build(connector: impl Connector + 'static, codec: C, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connection: ConnectionHandle::new(connector, options.restore_capacity),
                codec,
                options,
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.inner.connection
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Listen for the store connection coming back after a drop. Subscriptions are not
    /// re-established automatically; listeners decide what to resubscribe.
    pub fn on_connection_restored(&self) -> RestoreListener {
        self.inner.connection.on_connection_restored()
    }

    pub(crate) async fn store(&self) -> ApiResult<Arc<dyn Store>> {
        self.inner.connection.store().await
    }
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.inner.connection)
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Client, ClientOptions};
    use crate::core::error::ErrorKind;
    use crate::core::memory::MemoryStore;

    #[test]
    fn zero_scan_page_is_rejected() {
        let err = Client::with_options(
            MemoryStore::new(),
            ClientOptions::new().with_scan_page_size(0),
        )
        .expect_err("invalid options");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn clones_share_one_connection() {
        let client = Client::new(MemoryStore::new());
        let clone = client.clone();
        assert!(!clone.connection().is_established());
        client.store().await.expect("store");
        assert!(clone.connection().is_established());
    }
}
