//! Purpose: Key-value cache operations with TTLs, connectivity state, and key enumeration.
//! Exports: `CacheProvider`, `CacheState`, `CacheKeys`, `KeyScan`.
//! Role: Stateless request/response wrappers over the store through the client codec.
//! Invariants: `get` on an absent key yields `T::default()`; `try_get` reports presence.
//! Invariants: `set_many` is one atomic store batch; a fault sets none of the keys.
//! Invariants: Key scans are lazy, page by page, and restart from scratch on each call.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ApiResult, Client};
use crate::core::codec::{Codec, FieldPolicy};
use crate::core::error::{Error, ErrorKind};

#[async_trait]
pub trait CacheProvider {
    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> ApiResult<()>
    where
        T: Serialize + Sync + ?Sized;

    async fn set_with_policy<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        policy: &dyn FieldPolicy,
    ) -> ApiResult<()>
    where
        T: Serialize + Sync + ?Sized;

    async fn set_many<T>(&self, values: &HashMap<String, T>, ttl: Duration) -> ApiResult<()>
    where
        T: Serialize + Sync;

    /// Absent keys decode to `T::default()`, so "never set" and "set to the default value"
    /// look the same. Use `try_get` when the difference matters.
    async fn get<T>(&self, key: &str) -> ApiResult<T>
    where
        T: DeserializeOwned + Default + Send;

    async fn try_get<T>(&self, key: &str) -> ApiResult<Option<T>>
    where
        T: DeserializeOwned + Default + Send;

    async fn delete(&self, key: &str) -> ApiResult<()>;

    async fn delete_many(&self, keys: &[String]) -> ApiResult<()>;
}

#[async_trait]
pub trait CacheState {
    async fn is_connected(&self) -> bool;
}

pub trait CacheKeys {
    fn keys(&self, pattern: &str) -> KeyScan;

    fn keys_matching<F>(&self, predicate: F) -> KeyScan
    where
        F: Fn(&str) -> bool + Send + Sync + 'static;
}

fn ensure_ttl(ttl: Duration) -> ApiResult<()> {
    if ttl.is_zero() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("ttl must be greater than zero")
            .with_hint("Pass a positive expiry such as Duration::from_secs(60)."));
    }
    Ok(())
}

#[async_trait]
impl<C: Codec> CacheProvider for Client<C> {
    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> ApiResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        ensure_ttl(ttl)?;
        let payload = self.codec().serialize(value, None)?;
        self.store()
            .await?
            .set(key, payload, ttl)
            .await
            .map_err(|err| err.with_key(key))
    }

    async fn set_with_policy<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        policy: &dyn FieldPolicy,
    ) -> ApiResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        ensure_ttl(ttl)?;
        let payload = self.codec().serialize(value, Some(policy))?;
        self.store()
            .await?
            .set(key, payload, ttl)
            .await
            .map_err(|err| err.with_key(key))
    }

    async fn set_many<T>(&self, values: &HashMap<String, T>, ttl: Duration) -> ApiResult<()>
    where
        T: Serialize + Sync,
    {
        ensure_ttl(ttl)?;
        if values.is_empty() {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(values.len());
        for (key, value) in values {
            let payload = self
                .codec()
                .serialize(value, None)
                .map_err(|err| err.with_key(key.clone()))?;
            entries.push((key.clone(), payload));
        }
        self.store().await?.set_batch(entries, ttl).await
    }

    async fn get<T>(&self, key: &str) -> ApiResult<T>
    where
        T: DeserializeOwned + Default + Send,
    {
        Ok(self.try_get(key).await?.unwrap_or_default())
    }

    async fn try_get<T>(&self, key: &str) -> ApiResult<Option<T>>
    where
        T: DeserializeOwned + Default + Send,
    {
        let store = self.store().await?;
        let Some(payload) = store.get(key).await.map_err(|err| err.with_key(key))? else {
            return Ok(None);
        };
        self.codec()
            .deserialize(&payload)
            .map(Some)
            .map_err(|err| err.with_key(key))
    }

    async fn delete(&self, key: &str) -> ApiResult<()> {
        self.store()
            .await?
            .delete(&[key.to_string()])
            .await
            .map(|_| ())
            .map_err(|err| err.with_key(key))
    }

    async fn delete_many(&self, keys: &[String]) -> ApiResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.store().await?.delete(keys).await.map(|_| ())
    }
}

#[async_trait]
impl<C: Codec> CacheState for Client<C> {
    async fn is_connected(&self) -> bool {
        self.connection().is_connected().await
    }
}

impl<C: Codec> CacheKeys for Client<C> {
    fn keys(&self, pattern: &str) -> KeyScan {
        KeyScan::new(self.clone(), pattern.to_string(), None)
    }

    fn keys_matching<F>(&self, predicate: F) -> KeyScan
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        KeyScan::new(self.clone(), "*".to_string(), Some(Arc::new(predicate)))
    }
}

type KeyFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Lazy walk over server-side key enumeration, one page per store round-trip.
pub struct KeyScan {
    fetch: Box<dyn PageFetch>,
    pattern: String,
    filter: Option<KeyFilter>,
    cursor: u64,
    buffered: VecDeque<String>,
    exhausted: bool,
}

#[async_trait]
trait PageFetch: Send + Sync {
    async fn fetch(&self, pattern: &str, cursor: u64) -> ApiResult<crate::core::store::KeyPage>;
}

struct ClientPages<C: Codec> {
    client: Client<C>,
}

#[async_trait]
impl<C: Codec> PageFetch for ClientPages<C> {
    async fn fetch(&self, pattern: &str, cursor: u64) -> ApiResult<crate::core::store::KeyPage> {
        let page_size = self.client.options().scan_page_size;
        self.client
            .store()
            .await?
            .scan_keys(pattern, cursor, page_size)
            .await
    }
}

impl KeyScan {
    fn new<C: Codec>(client: Client<C>, pattern: String, filter: Option<KeyFilter>) -> Self {
        Self {
            fetch: Box::new(ClientPages { client }),
            pattern,
            filter,
            cursor: 0,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn next_key(&mut self) -> ApiResult<Option<String>> {
        loop {
            if let Some(key) = self.buffered.pop_front() {
                return Ok(Some(key));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.fetch.fetch(&self.pattern, self.cursor).await?;
            self.cursor = page.next_cursor;
            self.exhausted = page.next_cursor == 0;
            let filter = self.filter.as_ref();
            self.buffered.extend(
                page.keys
                    .into_iter()
                    .filter(|key| filter.is_none_or(|keep| keep(key.as_str()))),
            );
        }
    }

    /// Drain the remaining keys into memory.
    pub async fn collect_all(mut self) -> ApiResult<Vec<String>> {
        let mut keys = Vec::new();
        while let Some(key) = self.next_key().await? {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Pump keys from a background task. The scan stops after the first error.
    pub fn into_stream(mut self) -> ReceiverStream<ApiResult<String>> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let next = self.next_key().await;
                let stop = !matches!(next, Ok(Some(_)));
                let item = match next {
                    Ok(Some(key)) => Ok(key),
                    Ok(None) => break,
                    Err(err) => Err(err),
                };
                if tx.send(item).await.is_err() || stop {
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

impl fmt::Debug for KeyScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyScan")
            .field("pattern", &self.pattern)
            .field("filtered", &self.filter.is_some())
            .field("cursor", &self.cursor)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
