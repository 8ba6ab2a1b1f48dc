// Primitive operations a backing store connection must provide.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::error::Error;
use crate::core::notify::RestoreNotifier;
use crate::core::position::{StreamEntry, StreamPosition};

/// Invoked on the store's dispatch path for every message on a subscribed channel.
/// Must not block; hand work off to a queue.
pub type MessageHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(pub u64);

/// One page of a server-side key scan. `next_cursor == 0` ends the scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyPage {
    pub next_cursor: u64,
    pub keys: Vec<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn endpoint(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), Error>;

    /// All entries land together or none do.
    async fn set_batch(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<(), Error>;

    /// Returns the number of keys that existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, Error>;

    async fn key_exists(&self, key: &str) -> Result<bool, Error>;

    async fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> Result<KeyPage, Error>;

    async fn list_push_front(&self, key: &str, value: Bytes) -> Result<u64, Error>;

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>, Error>;

    async fn list_len(&self, key: &str) -> Result<u64, Error>;

    async fn list_index(&self, key: &str, index: i64) -> Result<Option<Bytes>, Error>;

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), Error>;

    /// Entries strictly after `after`, oldest first, at most `count`.
    async fn stream_read(
        &self,
        key: &str,
        after: &StreamPosition,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Error>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, Error>;

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<HandlerId, Error>;

    /// Removes one handler. Unknown ids are ignored.
    async fn unsubscribe_handler(&self, channel: &str, id: HandlerId) -> Result<(), Error>;

    /// Removes every handler on the channel. Unknown channels are ignored.
    async fn unsubscribe(&self, channel: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection. The notifier must be fired each time a lost connection
    /// is re-established.
    async fn connect(&self, notifier: RestoreNotifier) -> Result<Arc<dyn Store>, Error>;
}

/// Lock a registry mutex, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Resolve a Redis-style inclusive `[start, stop]` window, negative indexes counting from
/// the end, against a list of `len` items. `None` when the window is empty.
pub fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Redis-style glob matching: `*`, `?`, `[abc]`, `[a-z]`, `[^a]`, and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    let Some((&first, rest)) = pattern.split_first() else {
        return text.is_empty();
    };
    match first {
        '*' => (0..=text.len()).any(|skip| glob_match_at(rest, &text[skip..])),
        '?' => !text.is_empty() && glob_match_at(rest, &text[1..]),
        '[' => {
            let Some((&ch, tail)) = text.split_first() else {
                return false;
            };
            match match_class(rest, ch) {
                Some((matched, after)) => matched && glob_match_at(after, tail),
                None => ch == '[' && glob_match_at(rest, tail),
            }
        }
        '\\' if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match_at(&rest[1..], &text[1..])
        }
        literal => text.first() == Some(&literal) && glob_match_at(rest, &text[1..]),
    }
}

/// Returns whether `ch` is in the class and the pattern after `]`; `None` if unterminated.
fn match_class(pattern: &[char], ch: char) -> Option<(bool, &[char])> {
    let (negate, mut idx) = match pattern.first() {
        Some('^') => (true, 1),
        _ => (false, 0),
    };
    let mut matched = false;
    while idx < pattern.len() {
        match pattern[idx] {
            ']' => return Some((matched != negate, &pattern[idx + 1..])),
            '\\' if idx + 1 < pattern.len() => {
                matched |= pattern[idx + 1] == ch;
                idx += 2;
            }
            lo if idx + 2 < pattern.len() && pattern[idx + 1] == '-' && pattern[idx + 2] != ']' => {
                let hi = pattern[idx + 2];
                matched |= lo <= ch && ch <= hi;
                idx += 3;
            }
            other => {
                matched |= other == ch;
                idx += 1;
            }
        }
    }
    None
}
