// List operations with a per-index fallback when a range read times out.
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ApiResult, Client};
use crate::core::codec::{Codec, FieldPolicy};
use crate::core::error::ErrorKind;
use crate::core::store::{Store, normalize_range};

#[async_trait]
pub trait ListProvider {
    /// Push onto the head of the list. Returns the list length after the push.
    async fn list_left_push<T>(&self, key: &str, item: &T) -> ApiResult<u64>
    where
        T: Serialize + Sync + ?Sized;

    async fn list_left_push_with_policy<T>(
        &self,
        key: &str,
        item: &T,
        policy: &dyn FieldPolicy,
    ) -> ApiResult<u64>
    where
        T: Serialize + Sync + ?Sized;

    /// Items in the inclusive window `[start, stop]`; `stop = -1` reads to the end.
    async fn list_range<T>(&self, key: &str, start: i64, stop: i64) -> ApiResult<Vec<T>>
    where
        T: DeserializeOwned + Default + Send;

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> ApiResult<()>;
}

#[async_trait]
impl<C: Codec> ListProvider for Client<C> {
    async fn list_left_push<T>(&self, key: &str, item: &T) -> ApiResult<u64>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = self.codec().serialize(item, None)?;
        self.store()
            .await?
            .list_push_front(key, payload)
            .await
            .map_err(|err| err.with_key(key))
    }

    async fn list_left_push_with_policy<T>(
        &self,
        key: &str,
        item: &T,
        policy: &dyn FieldPolicy,
    ) -> ApiResult<u64>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = self.codec().serialize(item, Some(policy))?;
        self.store()
            .await?
            .list_push_front(key, payload)
            .await
            .map_err(|err| err.with_key(key))
    }

    async fn list_range<T>(&self, key: &str, start: i64, stop: i64) -> ApiResult<Vec<T>>
    where
        T: DeserializeOwned + Default + Send,
    {
        let store = self.store().await?;
        let payloads = match store.list_range(key, start, stop).await {
            Ok(payloads) => payloads,
            Err(err) if err.kind() == ErrorKind::Timeout => {
                tracing::warn!(key, start, stop, "list range timed out; reading item by item");
                read_by_index(store.as_ref(), key, start, stop).await?
            }
            Err(err) => return Err(err.with_key(key)),
        };
        payloads
            .iter()
            .map(|payload| self.codec().deserialize(payload))
            .collect::<ApiResult<Vec<T>>>()
            .map_err(|err| err.with_key(key))
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> ApiResult<()> {
        self.store()
            .await?
            .list_trim(key, start, stop)
            .await
            .map_err(|err| err.with_key(key))
    }
}

async fn read_by_index(
    store: &dyn Store,
    key: &str,
    start: i64,
    stop: i64,
) -> ApiResult<Vec<bytes::Bytes>> {
    let len = store
        .list_len(key)
        .await
        .map_err(|err| err.with_key(key))?;
    let Some((from, to)) = normalize_range(len as usize, start, stop) else {
        return Ok(Vec::new());
    };
    let mut payloads = Vec::with_capacity(to - from + 1);
    for index in from..=to {
        // Items trimmed away between LLEN and LINDEX end the read early.
        match store
            .list_index(key, index as i64)
            .await
            .map_err(|err| err.with_key(key))?
        {
            Some(payload) => payloads.push(payload),
            None => break,
        }
    }
    Ok(payloads)
}
