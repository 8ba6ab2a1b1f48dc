//! Purpose: Publish/subscribe messaging over store channels.
//! Exports: `CacheSubscription`, `Subscription`, `MessageSink`, `MessageReceiver`,
//! `SinkPolicy`, `SinkOffer`, `message_channel`.
//! Role: Typed layer over the store's raw channel handlers.
//! Invariants: A `Subscription` owns exactly one handler registration and removes it once,
//! Invariants: on `close` or on drop, whichever comes first. Closing twice is a no-op.
//! Invariants: `wait_one` removes its handler before returning, success or failure.
//! Invariants: Sinks never block the store's dispatch path.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_stream::Stream;

use super::{ApiResult, Client};
use crate::core::codec::Codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{HandlerId, MessageHandler, Store};

/// Buffering behavior between the dispatch path and a durable subscriber.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SinkPolicy {
    /// Unbounded; a stalled reader grows memory.
    #[default]
    Grow,
    /// Bounded; messages arriving while `capacity` are queued are dropped and counted.
    DropNewest { capacity: usize },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkOffer {
    Accepted,
    Dropped,
    Closed,
}

enum SinkTx<T> {
    Grow(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum SinkRx<T> {
    Grow(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

/// Write half handed to `subscribe`.
pub struct MessageSink<T> {
    tx: SinkTx<T>,
    dropped: Arc<AtomicU64>,
}

pub struct MessageReceiver<T> {
    rx: SinkRx<T>,
    dropped: Arc<AtomicU64>,
}

/// A `DropNewest` capacity of zero is treated as one.
pub fn message_channel<T>(policy: SinkPolicy) -> (MessageSink<T>, MessageReceiver<T>) {
    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, rx) = match policy {
        SinkPolicy::Grow => {
            let (tx, rx) = mpsc::unbounded_channel();
            (SinkTx::Grow(tx), SinkRx::Grow(rx))
        }
        SinkPolicy::DropNewest { capacity } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (SinkTx::Bounded(tx), SinkRx::Bounded(rx))
        }
    };
    (
        MessageSink {
            tx,
            dropped: Arc::clone(&dropped),
        },
        MessageReceiver { rx, dropped },
    )
}

impl<T> MessageSink<T> {
    pub fn offer(&self, message: T) -> SinkOffer {
        match &self.tx {
            SinkTx::Grow(tx) => match tx.send(message) {
                Ok(()) => SinkOffer::Accepted,
                Err(_) => SinkOffer::Closed,
            },
            SinkTx::Bounded(tx) => match tx.try_send(message) {
                Ok(()) => SinkOffer::Accepted,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    SinkOffer::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => SinkOffer::Closed,
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Clone for MessageSink<T> {
    fn clone(&self) -> Self {
        let tx = match &self.tx {
            SinkTx::Grow(tx) => SinkTx::Grow(tx.clone()),
            SinkTx::Bounded(tx) => SinkTx::Bounded(tx.clone()),
        };
        Self {
            tx,
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> fmt::Debug for MessageSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSink")
            .field("bounded", &matches!(self.tx, SinkTx::Bounded(_)))
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<T> MessageReceiver<T> {
    /// Next message, or `None` once every sink is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.rx {
            SinkRx::Grow(rx) => rx.recv().await,
            SinkRx::Bounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.rx {
            SinkRx::Grow(rx) => rx.try_recv().ok(),
            SinkRx::Bounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Messages discarded because the bounded queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Stream for MessageReceiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match &mut self.get_mut().rx {
            SinkRx::Grow(rx) => rx.poll_recv(cx),
            SinkRx::Bounded(rx) => rx.poll_recv(cx),
        }
    }
}

impl<T> fmt::Debug for MessageReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// One registered channel handler. Dropping it unsubscribes in the background.
pub struct Subscription {
    channel: String,
    handler: HandlerId,
    store: Arc<dyn Store>,
    closed: AtomicBool,
}

impl Subscription {
    fn new(channel: &str, handler: HandlerId, store: Arc<dyn Store>) -> Self {
        Self {
            channel: channel.to_string(),
            handler,
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove the handler. Later calls (and the drop) do nothing.
    pub async fn close(&self) -> ApiResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(channel = %self.channel, "unsubscribing");
        self.store
            .unsubscribe_handler(&self.channel, self.handler)
            .await
            .map_err(|err| err.with_key(self.channel.as_str()))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = std::mem::take(&mut self.channel);
        let handler = self.handler;
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = store.unsubscribe_handler(&channel, handler).await {
                        tracing::warn!(channel = %channel, error = %err, "background unsubscribe failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    channel = %channel,
                    "subscription dropped outside a runtime; handler left registered"
                );
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("handler", &self.handler)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
pub trait CacheSubscription {
    /// Returns how many subscribers the store delivered the message to.
    async fn publish<T>(&self, channel: &str, message: &T) -> ApiResult<u64>
    where
        T: Serialize + Sync + ?Sized;

    /// Publishes concurrently once every message has been encoded. The first failure is
    /// returned after all publishes have finished.
    async fn publish_many<T>(&self, messages: &HashMap<String, T>) -> ApiResult<()>
    where
        T: Serialize + Sync;

    /// Resolve with the first message on `channel`. Wrap in `tokio::time::timeout` to bound
    /// the wait; the handler is removed either way.
    async fn wait_one<T>(&self, channel: &str) -> ApiResult<T>
    where
        T: DeserializeOwned + Default + Send;

    async fn subscribe<T>(&self, channel: &str, sink: MessageSink<T>) -> ApiResult<Subscription>
    where
        T: DeserializeOwned + Default + Send + 'static;

    /// Remove every handler on `channel`, including ones owned by live `Subscription`s.
    async fn unsubscribe(&self, channel: &str) -> ApiResult<()>;
}

#[async_trait]
impl<C: Codec> CacheSubscription for Client<C> {
    async fn publish<T>(&self, channel: &str, message: &T) -> ApiResult<u64>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = self.codec().serialize(message, None)?;
        self.store()
            .await?
            .publish(channel, payload)
            .await
            .map_err(|err| err.with_key(channel))
    }

    async fn publish_many<T>(&self, messages: &HashMap<String, T>) -> ApiResult<()>
    where
        T: Serialize + Sync,
    {
        let mut encoded = Vec::with_capacity(messages.len());
        for (channel, message) in messages {
            let payload = self
                .codec()
                .serialize(message, None)
                .map_err(|err| err.with_key(channel.clone()))?;
            encoded.push((channel.clone(), payload));
        }
        if encoded.is_empty() {
            return Ok(());
        }

        let store = self.store().await?;
        let mut tasks = JoinSet::new();
        for (channel, payload) in encoded {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                store
                    .publish(&channel, payload)
                    .await
                    .map_err(|err| err.with_key(channel))
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("publish task failed")
                    .with_source(err)
            });
            if let Err(err) = outcome.and_then(|published| published.map(|_| ())) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn wait_one<T>(&self, channel: &str) -> ApiResult<T>
    where
        T: DeserializeOwned + Default + Send,
    {
        let store = self.store().await?;
        let (tx, rx) = oneshot::channel::<Bytes>();
        let slot = Mutex::new(Some(tx));
        let handler: MessageHandler = Arc::new(move |_channel: &str, payload: Bytes| {
            let sender = slot.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(payload);
            }
        });
        let id = store
            .subscribe(channel, handler)
            .await
            .map_err(|err| err.with_key(channel))?;
        let subscription = Subscription::new(channel, id, store);

        let received = rx.await;
        if let Err(err) = subscription.close().await {
            tracing::warn!(channel, error = %err, "failed to remove one-shot handler");
        }
        let payload = received.map_err(|_| {
            Error::new(ErrorKind::StoreUnavailable)
                .with_message("subscription ended before a message arrived")
                .with_key(channel)
        })?;
        self.codec()
            .deserialize(&payload)
            .map_err(|err| err.with_key(channel))
    }

    async fn subscribe<T>(&self, channel: &str, sink: MessageSink<T>) -> ApiResult<Subscription>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        let store = self.store().await?;
        let codec = self.codec().clone();
        let handler: MessageHandler = Arc::new(move |channel: &str, payload: Bytes| {
            let message = match codec.deserialize::<T>(&payload) {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(channel, error = %err, "dropping undecodable message");
                    return;
                }
            };
            match sink.offer(message) {
                SinkOffer::Accepted => {}
                SinkOffer::Dropped => {
                    tracing::warn!(
                        channel,
                        dropped = sink.dropped(),
                        "subscriber queue full; message dropped"
                    );
                }
                SinkOffer::Closed => {
                    tracing::debug!(channel, "subscriber gone; message discarded");
                }
            }
        });
        let id = store
            .subscribe(channel, handler)
            .await
            .map_err(|err| err.with_key(channel))?;
        tracing::debug!(channel, "subscribed");
        Ok(Subscription::new(channel, id, store))
    }

    async fn unsubscribe(&self, channel: &str) -> ApiResult<()> {
        self.store()
            .await?
            .unsubscribe(channel)
            .await
            .map_err(|err| err.with_key(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::{SinkOffer, SinkPolicy, message_channel};

    #[tokio::test]
    async fn grow_policy_accepts_everything() {
        let (sink, mut receiver) = message_channel::<u32>(SinkPolicy::Grow);
        for n in 0..1000 {
            assert_eq!(sink.offer(n), SinkOffer::Accepted);
        }
        assert_eq!(receiver.recv().await, Some(0));
        assert_eq!(receiver.dropped(), 0);
    }

    #[tokio::test]
    async fn bounded_policy_drops_newest_and_counts() {
        let (sink, mut receiver) = message_channel::<u32>(SinkPolicy::DropNewest { capacity: 2 });
        assert_eq!(sink.offer(1), SinkOffer::Accepted);
        assert_eq!(sink.offer(2), SinkOffer::Accepted);
        assert_eq!(sink.offer(3), SinkOffer::Dropped);
        assert_eq!(receiver.dropped(), 1);
        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, Some(2));
        assert_eq!(receiver.try_recv(), None);
    }

    #[test]
    fn offers_after_receiver_drop_report_closed() {
        let (sink, receiver) = message_channel::<u32>(SinkPolicy::Grow);
        drop(receiver);
        assert_eq!(sink.offer(1), SinkOffer::Closed);
    }
}
