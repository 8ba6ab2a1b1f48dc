//! Purpose: Define the public client API over a remote in-memory store.
//! Exports: `Client` plus one capability trait per operation group, and the remote backend.
//! Role: Stable surface used by the `cachelink` CLI and by applications.
//! Invariants: Every capability trait is implemented on `Client`; no ambient state.
//! Invariants: Core types callers need (errors, codec, positions, cancellation) are re-exported.

mod cache;
mod client;
mod consumer;
mod list;
mod pubsub;
mod remote;

pub use crate::core::cancel::Cancellation;
pub use crate::core::codec::{CamelCaseFields, Codec, FieldPolicy, JsonCodec, OmitFields};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::memory::MemoryStore;
pub use crate::core::notify::{ConnectionRestored, RestoreListener};
pub use crate::core::position::{StreamEntry, StreamPosition};
pub use crate::core::store::{Connector, Store};
pub use cache::{CacheKeys, CacheProvider, CacheState, KeyScan};
pub use client::{ApiResult, Client, ClientOptions};
pub use consumer::{CacheConsumer, ConsumeSettings, StreamTail, TailState};
pub use list::ListProvider;
pub use pubsub::{
    CacheSubscription, MessageReceiver, MessageSink, SinkOffer, SinkPolicy, Subscription,
    message_channel,
};
pub use remote::{RemoteConfig, RemoteConnector, RemoteStore};
