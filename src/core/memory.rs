// In-process store with TTLs, lists, streams, channels, and fault injection hooks.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::core::error::{Error, ErrorKind};
use crate::core::notify::{ConnectionRestored, RestoreNotifier};
use crate::core::position::{StreamEntry, StreamPosition};
use crate::core::store::{
    Connector, HandlerId, KeyPage, MessageHandler, Store, glob_match, lock,
    normalize_range,
};

const ENDPOINT: &str = "memory://local";

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    disconnected: AtomicBool,
    refuse_connect: AtomicBool,
    reconnects: AtomicU64,
    next_handler: AtomicU64,
    notifier: Mutex<Option<RestoreNotifier>>,
    stream_read_failures: AtomicUsize,
    batch_failures: AtomicUsize,
    range_timeouts: AtomicUsize,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, VecDeque<Bytes>>,
    streams: HashMap<String, StreamLog>,
    channels: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
}

struct StringEntry {
    value: Bytes,
    expires_at: Instant,
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<StreamEntry>,
    last: (u64, u64),
}

impl MemoryState {
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, entry| entry.expires_at > now);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a dropped connection; every primitive fails until `reconnect`.
    pub fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);
    }

    /// Restore the connection and fire the connectivity-restored notification.
    pub fn reconnect(&self) {
        self.inner.disconnected.store(false, Ordering::SeqCst);
        let reconnects = self.inner.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = lock(&self.inner.notifier).clone();
        if let Some(notifier) = notifier {
            notifier.notify(ConnectionRestored {
                endpoint: ENDPOINT.to_string(),
                reconnects,
            });
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_next_stream_reads(&self, count: usize) {
        self.inner.stream_read_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_batches(&self, count: usize) {
        self.inner.batch_failures.store(count, Ordering::SeqCst);
    }

    pub fn time_out_next_list_ranges(&self, count: usize) {
        self.inner.range_timeouts.store(count, Ordering::SeqCst);
    }

    /// Append an entry with an auto-generated `<ms>-<seq>` id.
    pub fn stream_add(&self, key: &str, fields: Vec<(String, Bytes)>) -> StreamPosition {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);
        let mut state = self.state();
        let log = state.streams.entry(key.to_string()).or_default();
        let (last_ms, last_seq) = log.last;
        let next = if now_ms > last_ms {
            (now_ms, 0)
        } else {
            (last_ms, last_seq + 1)
        };
        log.last = next;
        let id = StreamPosition::from_parts(next.0, next.1);
        log.entries.push(StreamEntry::new(id.clone(), fields));
        id
    }

    /// Append a single-field entry.
    pub fn stream_add_value(&self, key: &str, payload: impl Into<Bytes>) -> StreamPosition {
        self.stream_add(key, vec![("value".to_string(), payload.into())])
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state().channels.get(channel).map_or(0, Vec::len)
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state();
        state
            .live_string(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.inner.state)
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message("store connection is down")
                .with_hint("Wait for the connection to be restored."));
        }
        Ok(())
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn endpoint(&self) -> String {
        ENDPOINT.to_string()
    }

    fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        self.ensure_connected()?;
        Ok(self.state().live_string(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), Error> {
        self.ensure_connected()?;
        self.state().strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_batch(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<(), Error> {
        self.ensure_connected()?;
        if Self::take_fault(&self.inner.batch_failures) {
            return Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message("connection dropped while executing batch"));
        }
        let expires_at = Instant::now() + ttl;
        let mut state = self.state();
        for (key, value) in entries {
            state.strings.insert(key, StringEntry { value, expires_at });
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, Error> {
        self.ensure_connected()?;
        let mut state = self.state();
        state.purge_expired();
        let mut removed = 0;
        for key in keys {
            let existed = state.strings.remove(key).is_some()
                | state.lists.remove(key).is_some()
                | state.streams.remove(key).is_some();
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, Error> {
        self.ensure_connected()?;
        let mut state = self.state();
        Ok(state.live_string(key).is_some()
            || state.lists.contains_key(key)
            || state.streams.contains_key(key))
    }

    async fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> Result<KeyPage, Error> {
        self.ensure_connected()?;
        let mut state = self.state();
        state.purge_expired();
        let all: BTreeSet<&String> = state
            .strings
            .keys()
            .chain(state.lists.keys())
            .chain(state.streams.keys())
            .collect();
        let offset = cursor as usize;
        let page_end = offset.saturating_add(count.max(1));
        let keys = all
            .iter()
            .skip(offset)
            .take(page_end - offset)
            .filter(|key| glob_match(pattern, key))
            .map(|key| key.to_string())
            .collect();
        let next_cursor = if page_end < all.len() {
            page_end as u64
        } else {
            0
        };
        Ok(KeyPage { next_cursor, keys })
    }

    async fn list_push_front(&self, key: &str, value: Bytes) -> Result<u64, Error> {
        self.ensure_connected()?;
        let mut state = self.state();
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        Ok(list.len() as u64)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>, Error> {
        self.ensure_connected()?;
        if Self::take_fault(&self.inner.range_timeouts) {
            return Err(Error::new(ErrorKind::Timeout)
                .with_message("list range timed out")
                .with_key(key));
        }
        let state = self.state();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn list_len(&self, key: &str) -> Result<u64, Error> {
        self.ensure_connected()?;
        Ok(self.state().lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn list_index(&self, key: &str, index: i64) -> Result<Option<Bytes>, Error> {
        self.ensure_connected()?;
        let state = self.state();
        let Some(list) = state.lists.get(key) else {
            return Ok(None);
        };
        let resolved = if index < 0 {
            list.len() as i64 + index
        } else {
            index
        };
        if resolved < 0 {
            return Ok(None);
        }
        Ok(list.get(resolved as usize).cloned())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), Error> {
        self.ensure_connected()?;
        let mut state = self.state();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(());
        };
        match normalize_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => {
                state.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn stream_read(
        &self,
        key: &str,
        after: &StreamPosition,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Error> {
        self.ensure_connected()?;
        if Self::take_fault(&self.inner.stream_read_failures) {
            return Err(Error::new(ErrorKind::TransientRead)
                .with_message("stream read failed")
                .with_key(key));
        }
        let state = self.state();
        let Some(log) = state.streams.get(key) else {
            return Ok(Vec::new());
        };
        Ok(log
            .entries
            .iter()
            .filter(|entry| entry.id > *after)
            .take(count)
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, Error> {
        self.ensure_connected()?;
        let handlers: Vec<MessageHandler> = self
            .state()
            .channels
            .get(channel)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(channel, payload.clone());
        }
        Ok(handlers.len() as u64)
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<HandlerId, Error> {
        self.ensure_connected()?;
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::SeqCst) + 1);
        self.state()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    async fn unsubscribe_handler(&self, channel: &str, id: HandlerId) -> Result<(), Error> {
        self.ensure_connected()?;
        let mut state = self.state();
        if let Some(handlers) = state.channels.get_mut(channel) {
            handlers.retain(|(existing, _)| *existing != id);
            if handlers.is_empty() {
                state.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), Error> {
        self.ensure_connected()?;
        self.state().channels.remove(channel);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self, notifier: RestoreNotifier) -> Result<Arc<dyn Store>, Error> {
        if self.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message("connection refused")
                .with_key(ENDPOINT));
        }
        *lock(&self.inner.notifier) = Some(notifier);
        Ok(Arc::new(self.clone()))
    }
}
