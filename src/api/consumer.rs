//! Purpose: Tail an append-only store stream as a lazy, cancellable sequence of typed items.
//! Exports: `CacheConsumer`, `ConsumeSettings`, `StreamTail`, `TailState`.
//! Role: Poll/deliver loop over `StreamCursor`; the only long-lived reader state in the crate.
//! Invariants: Items come out in cursor order; one poll/deliver cycle at a time per tail.
//! Invariants: Read failures never end the sequence; the same window is requested again.
//! Invariants: Cancellation and connectivity are checked only once a poll's items are drained.
//! Notes: Each field value of an entry is one item; undecodable values are logged and skipped.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ApiResult, Client};
use crate::core::cancel::Cancellation;
use crate::core::codec::{Codec, JsonCodec};
use crate::core::cursor::{PollResult, StreamCursor};
use crate::core::error::{Error, ErrorKind};
use crate::core::position::StreamPosition;

#[derive(Clone, Debug)]
pub struct ConsumeSettings {
    prefetch: usize,
    position: StreamPosition,
    idle_interval: Duration,
}

impl ConsumeSettings {
    pub const DEFAULT_PREFETCH: usize = 100;
    pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(prefetch: usize, position: impl Into<StreamPosition>) -> ApiResult<Self> {
        if prefetch == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("prefetch count must be greater than zero"));
        }
        Ok(Self {
            prefetch,
            position: position.into(),
            idle_interval: Self::DEFAULT_IDLE_INTERVAL,
        })
    }

    /// Pause between a poll that returned nothing (or failed) and the next one.
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    pub fn position(&self) -> &StreamPosition {
        &self.position
    }

    pub fn idle_interval(&self) -> Duration {
        self.idle_interval
    }
}

impl Default for ConsumeSettings {
    fn default() -> Self {
        Self {
            prefetch: Self::DEFAULT_PREFETCH,
            position: StreamPosition::beginning(),
            idle_interval: Self::DEFAULT_IDLE_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TailState {
    Idle,
    Polling,
    Delivering,
    Completed,
}

pub struct StreamTail<T, C: Codec = JsonCodec> {
    client: Client<C>,
    stream: String,
    cursor: StreamCursor,
    prefetch: usize,
    idle_interval: Duration,
    cancel: Cancellation,
    pending: VecDeque<(StreamPosition, Bytes)>,
    last_delivered: Option<StreamPosition>,
    state: TailState,
    idle_before_poll: bool,
    skipped: u64,
    polls: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T, C> StreamTail<T, C>
where
    T: DeserializeOwned + Default,
    C: Codec,
{
    fn new(client: Client<C>, stream: &str, settings: ConsumeSettings, cancel: Cancellation) -> Self {
        Self {
            client,
            stream: stream.to_string(),
            cursor: StreamCursor::new(settings.position),
            prefetch: settings.prefetch,
            idle_interval: settings.idle_interval,
            cancel,
            pending: VecDeque::new(),
            last_delivered: None,
            state: TailState::Idle,
            idle_before_poll: false,
            skipped: 0,
            polls: 0,
            _item: PhantomData,
        }
    }

    /// Next decoded item, or `None` once cancelled or disconnected.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if self.state == TailState::Completed {
                return None;
            }

            if let Some((id, payload)) = self.pending.pop_front() {
                self.state = TailState::Delivering;
                match self.client.codec().deserialize::<T>(&payload) {
                    Ok(item) => {
                        self.last_delivered = Some(id);
                        return Some(item);
                    }
                    Err(err) => {
                        self.skipped += 1;
                        tracing::error!(
                            stream = %self.stream,
                            entry = %id,
                            error = %err,
                            "skipping undecodable stream entry"
                        );
                        continue;
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return self.complete("cancelled");
            }
            let store = match self.client.store().await {
                Ok(store) => store,
                Err(err) => {
                    tracing::warn!(stream = %self.stream, error = %err, "store unreachable");
                    return self.complete("store unreachable");
                }
            };
            if !store.is_connected() {
                return self.complete("disconnected");
            }

            if self.idle_before_poll {
                self.idle_before_poll = false;
                tokio::select! {
                    _ = self.cancel.cancelled() => return self.complete("cancelled"),
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
                continue;
            }

            self.state = TailState::Polling;
            self.polls += 1;
            match self
                .cursor
                .poll(store.as_ref(), &self.stream, self.prefetch)
                .await
            {
                PollResult::Entries(entries) => {
                    for entry in entries {
                        for (_, value) in entry.fields {
                            self.pending.push_back((entry.id.clone(), value));
                        }
                    }
                }
                PollResult::Empty | PollResult::Failed => self.idle_before_poll = true,
            }
        }
    }

    fn complete(&mut self, reason: &'static str) -> Option<T> {
        tracing::debug!(
            stream = %self.stream,
            position = %self.cursor.position(),
            reason,
            "stream tail completed"
        );
        self.state = TailState::Completed;
        None
    }

    /// Position of the last entry read from the store.
    pub fn cursor(&self) -> &StreamPosition {
        self.cursor.position()
    }

    /// Entry id of the last item handed to the caller.
    pub fn last_delivered(&self) -> Option<&StreamPosition> {
        self.last_delivered.as_ref()
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl<T, C> StreamTail<T, C>
where
    T: DeserializeOwned + Default + Send + 'static,
    C: Codec,
{
    /// Drive the tail from a background task. The task ends with the tail or when the
    /// returned stream is dropped.
    pub fn into_stream(mut self) -> ReceiverStream<T> {
        let (tx, rx) = mpsc::channel(self.prefetch.max(1));
        tokio::spawn(async move {
            loop {
                // `next` keeps polling an idle stream, so watch for the receiver going away.
                let item = tokio::select! {
                    _ = tx.closed() => break,
                    item = self.next() => item,
                };
                let Some(item) = item else { break };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            tracing::debug!(stream = %self.stream, "stream tail task finished");
        });
        ReceiverStream::new(rx)
    }
}

impl<T, C: Codec> fmt::Debug for StreamTail<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTail")
            .field("stream", &self.stream)
            .field("cursor", self.cursor.position())
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("skipped", &self.skipped)
            .field("polls", &self.polls)
            .finish()
    }
}

#[async_trait]
pub trait CacheConsumer {
    type Codec: Codec;

    /// Start tailing `stream`. Nothing is read until the first `next`.
    fn consume_stream<T>(
        &self,
        stream: &str,
        settings: ConsumeSettings,
        cancel: Cancellation,
    ) -> StreamTail<T, Self::Codec>
    where
        T: DeserializeOwned + Default + Send + 'static;

    /// Like `consume_stream`, but `None` when the store is disconnected or the stream
    /// does not exist yet.
    async fn try_consume_stream<T>(
        &self,
        stream: &str,
        settings: ConsumeSettings,
        cancel: Cancellation,
    ) -> Option<StreamTail<T, Self::Codec>>
    where
        T: DeserializeOwned + Default + Send + 'static;
}

#[async_trait]
impl<C: Codec> CacheConsumer for Client<C> {
    type Codec = C;

    fn consume_stream<T>(
        &self,
        stream: &str,
        settings: ConsumeSettings,
        cancel: Cancellation,
    ) -> StreamTail<T, C>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        StreamTail::new(self.clone(), stream, settings, cancel)
    }

    async fn try_consume_stream<T>(
        &self,
        stream: &str,
        settings: ConsumeSettings,
        cancel: Cancellation,
    ) -> Option<StreamTail<T, C>>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        if !self.connection().is_connected().await {
            tracing::warn!(stream, "not consuming stream: store is disconnected");
            return None;
        }
        let store = self.store().await.ok()?;
        match store.key_exists(stream).await {
            Ok(true) => Some(self.consume_stream(stream, settings, cancel)),
            Ok(false) => {
                tracing::warn!(stream, "not consuming stream: stream does not exist");
                None
            }
            Err(err) => {
                tracing::warn!(stream, error = %err, "not consuming stream: existence check failed");
                None
            }
        }
    }
}
