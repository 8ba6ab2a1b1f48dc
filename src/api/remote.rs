//! Purpose: Talk to a Redis-compatible server over RESP2 as a `Store`.
//! Exports: `RemoteConfig`, `RemoteConnector`, `RemoteStore`.
//! Role: Production backend behind `Client`; `MemoryStore` is the in-process counterpart.
//! Invariants: One command connection (serialized behind a mutex) plus one lazily opened
//! Invariants: pub/sub connection owned by a dispatch task.
//! Invariants: A transport failure or timeout drops the connection; a background task
//! Invariants: redials and fires the connectivity-restored notifier once it is back.
//! Invariants: Losing the pub/sub connection drops every handler; nothing resubscribes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use url::Url;

use super::ApiResult;
use crate::core::error::{Error, ErrorKind};
use crate::core::notify::{ConnectionRestored, RestoreNotifier};
use crate::core::position::{StreamEntry, StreamPosition};
use crate::core::resp::{RespValue, decode_reply, encode_command};
use crate::core::store::{Connector, HandlerId, KeyPage, MessageHandler, Store, lock};

const READ_CHUNK: usize = 16 * 1024;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(50);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub const DEFAULT_PORT: u16 = 6379;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Parse `redis://[[user]:password@]host[:port][/db]`.
    pub fn from_url(raw: &str) -> ApiResult<Self> {
        let url = Url::parse(raw).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid store url")
                .with_hint("Use redis://[:password@]host[:port][/db].")
                .with_source(err)
        })?;
        if url.scheme() != "redis" {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unsupported store url scheme '{}'", url.scheme()))
                .with_hint("Use redis://[:password@]host[:port][/db]."));
        }
        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("store url missing host"))?;
        let db = match url.path().trim_start_matches('/') {
            "" => 0,
            db => db.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid database index '{db}'"))
            })?,
        };

        let mut config = Self::new(host, url.port().unwrap_or(Self::DEFAULT_PORT)).with_db(db);
        if let Some(password) = url.password() {
            config.password = Some(password.to_string());
        }
        if !url.username().is_empty() {
            config.username = Some(url.username().to_string());
        }
        Ok(config)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Display form without credentials.
    pub fn endpoint(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("endpoint", &self.endpoint())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct RemoteConnector {
    config: RemoteConfig,
}

impl RemoteConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    pub fn from_url(raw: &str) -> ApiResult<Self> {
        RemoteConfig::from_url(raw).map(Self::new)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    async fn connect(&self, notifier: RestoreNotifier) -> Result<Arc<dyn Store>, Error> {
        let store = RemoteStore::open(self.config.clone(), notifier).await?;
        Ok(Arc::new(store))
    }
}

/// Command arguments as RESP bulk strings.
struct Command {
    args: Vec<Bytes>,
}

impl Command {
    fn new(name: &'static str) -> Self {
        Self {
            args: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    fn arg(mut self, value: impl Into<Bytes>) -> Self {
        self.args.push(value.into());
        self
    }

    fn text(self, value: &str) -> Self {
        self.arg(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn int(self, value: impl fmt::Display) -> Self {
        self.arg(value.to_string())
    }

    fn name(&self) -> &str {
        std::str::from_utf8(&self.args[0]).unwrap_or("?")
    }

    fn encode(&self, out: &mut BytesMut) {
        encode_command(&self.args, out);
    }
}

struct Conn {
    stream: TcpStream,
    buf: BytesMut,
}

impl Conn {
    async fn open(config: &RemoteConfig) -> ApiResult<Self> {
        let endpoint = config.endpoint();
        let handshake = async {
            let stream = TcpStream::connect((config.host.as_str(), config.port))
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::StoreUnavailable)
                        .with_message("failed to connect to store")
                        .with_key(endpoint.as_str())
                        .with_hint("Check that the server is running and the url is correct.")
                        .with_source(err)
                })?;
            let _ = stream.set_nodelay(true);
            let mut conn = Conn {
                stream,
                buf: BytesMut::with_capacity(READ_CHUNK),
            };
            if let Some(password) = &config.password {
                let mut auth = Command::new("AUTH");
                if let Some(username) = &config.username {
                    auth = auth.text(username);
                }
                conn.request(&auth.text(password))
                    .await?
                    .into_result()
                    .map_err(|err| {
                        err.with_message("authentication rejected")
                            .with_hint("Check the password in the store url.")
                    })?;
            }
            if config.db != 0 {
                conn.request(&Command::new("SELECT").int(config.db))
                    .await?
                    .into_result()?;
            }
            Ok::<_, Error>(conn)
        };
        tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| {
                Error::new(ErrorKind::Timeout)
                    .with_message("timed out connecting to store")
                    .with_key(endpoint.as_str())
            })?
    }

    async fn request(&mut self, command: &Command) -> ApiResult<RespValue> {
        let mut out = BytesMut::new();
        command.encode(&mut out);
        self.stream.write_all(&out).await.map_err(io_error)?;
        read_value(&mut self.stream, &mut self.buf).await
    }

    /// Write every command, then read one reply per command.
    async fn pipeline(&mut self, commands: &[Command]) -> ApiResult<Vec<RespValue>> {
        let mut out = BytesMut::new();
        for command in commands {
            command.encode(&mut out);
        }
        self.stream.write_all(&out).await.map_err(io_error)?;
        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(read_value(&mut self.stream, &mut self.buf).await?);
        }
        Ok(replies)
    }
}

async fn read_value<R>(reader: &mut R, buf: &mut BytesMut) -> ApiResult<RespValue>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(value) = decode_reply(buf)? {
            return Ok(value);
        }
        buf.reserve(READ_CHUNK);
        let read = reader.read_buf(buf).await.map_err(io_error)?;
        if read == 0 {
            return Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message("connection closed by server"));
        }
    }
}

fn io_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::StoreUnavailable)
        .with_message("store connection failed")
        .with_source(err)
}

fn unexpected(command: &str) -> Error {
    Error::new(ErrorKind::Protocol).with_message(format!("unexpected reply to {command}"))
}

#[derive(Default)]
struct Channels {
    handlers: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
    pending_acks: HashMap<String, Vec<oneshot::Sender<()>>>,
}

struct PubSubLink {
    writer: OwnedWriteHalf,
    reader: tokio::task::JoinHandle<()>,
}

struct RemoteInner {
    config: RemoteConfig,
    notifier: RestoreNotifier,
    command: tokio::sync::Mutex<Option<Conn>>,
    pubsub: tokio::sync::Mutex<Option<PubSubLink>>,
    channels: Mutex<Channels>,
    connected: AtomicBool,
    lost: AtomicBool,
    redialing: AtomicBool,
    reconnects: AtomicU64,
    next_handler: AtomicU64,
}

/// `Store` over a Redis-compatible server.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
}

impl RemoteStore {
    pub async fn open(config: RemoteConfig, notifier: RestoreNotifier) -> ApiResult<Self> {
        let conn = Conn::open(&config).await?;
        tracing::debug!(endpoint = %config.endpoint(), "connected to store");
        Ok(Self {
            inner: Arc::new(RemoteInner {
                config,
                notifier,
                command: tokio::sync::Mutex::new(Some(conn)),
                pubsub: tokio::sync::Mutex::new(None),
                channels: Mutex::new(Channels::default()),
                connected: AtomicBool::new(true),
                lost: AtomicBool::new(false),
                redialing: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                next_handler: AtomicU64::new(0),
            }),
        })
    }

    async fn execute(&self, command: Command) -> ApiResult<RespValue> {
        let mut replies = self.execute_all(vec![command]).await?;
        replies.pop().ok_or_else(|| unexpected("request"))
    }

    /// Run commands back to back on the command connection without interleaving.
    async fn execute_all(&self, commands: Vec<Command>) -> ApiResult<Vec<RespValue>> {
        let name = commands.first().map_or("", Command::name).to_string();
        let mut slot = self.inner.command.lock().await;
        if slot.is_none() {
            self.redial(&mut slot).await?;
        }
        let conn = slot.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::StoreUnavailable).with_message("store connection is down")
        })?;
        let outcome =
            tokio::time::timeout(self.inner.config.request_timeout, conn.pipeline(&commands)).await;
        match outcome {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(err)) => {
                *slot = None;
                drop(slot);
                self.connection_lost(&err);
                Err(err)
            }
            Err(_) => {
                // A late reply would desynchronize the stream; start over on a new socket.
                *slot = None;
                drop(slot);
                let err = Error::new(ErrorKind::Timeout)
                    .with_message(format!("{name} timed out"))
                    .with_hint("Raise the request timeout or check server load.");
                self.connection_lost(&err);
                Err(err)
            }
        }
    }

    /// The store only reports itself disconnected once a fresh dial has failed.
    async fn redial(&self, slot: &mut Option<Conn>) -> ApiResult<()> {
        let conn = match Conn::open(&self.inner.config).await {
            Ok(conn) => conn,
            Err(err) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        *slot = Some(conn);
        self.mark_restored();
        Ok(())
    }

    fn mark_restored(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        if self.inner.lost.swap(false, Ordering::SeqCst) {
            let reconnects = self.inner.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.notifier.notify(ConnectionRestored {
                endpoint: self.inner.config.endpoint(),
                reconnects,
            });
        }
    }

    fn connection_lost(&self, err: &Error) {
        if !self.inner.lost.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                endpoint = %self.inner.config.endpoint(),
                error = %err,
                "store connection lost"
            );
        }
        self.spawn_redial();
    }

    fn spawn_redial(&self) {
        if self.inner.redialing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.redialing.store(false, Ordering::SeqCst);
            return;
        };
        let store = self.clone();
        runtime.spawn(async move {
            let mut delay = RECONNECT_INITIAL_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                let mut slot = store.inner.command.lock().await;
                if slot.is_some() {
                    // Only the pub/sub link dropped; listeners still need to resubscribe.
                    store.mark_restored();
                    break;
                }
                match store.redial(&mut slot).await {
                    Ok(()) => break,
                    Err(err) => {
                        tracing::debug!(error = %err, retry_in = ?delay, "store redial failed");
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            }
            store.inner.redialing.store(false, Ordering::SeqCst);
        });
    }

    async fn send_pubsub(&self, command: Command) -> ApiResult<()> {
        let mut link = self.inner.pubsub.lock().await;
        if link.is_none() {
            *link = Some(self.open_pubsub().await?);
        }
        let Some(active) = link.as_mut() else {
            return Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message("pub/sub connection is down"));
        };
        let mut out = BytesMut::new();
        command.encode(&mut out);
        if let Err(err) = active.writer.write_all(&out).await {
            if let Some(dead) = link.take() {
                dead.reader.abort();
            }
            return Err(io_error(err));
        }
        Ok(())
    }

    async fn open_pubsub(&self) -> ApiResult<PubSubLink> {
        let conn = Conn::open(&self.inner.config).await?;
        let (reader, writer) = conn.stream.into_split();
        let store = self.clone();
        let reader = tokio::spawn(async move { store.dispatch(reader, conn.buf).await });
        tracing::debug!(endpoint = %self.inner.config.endpoint(), "pub/sub connection opened");
        Ok(PubSubLink { writer, reader })
    }

    async fn dispatch(self, mut reader: OwnedReadHalf, mut buf: BytesMut) {
        let err = loop {
            let value = match read_value(&mut reader, &mut buf).await {
                Ok(value) => value,
                Err(err) => break err,
            };
            let Some(mut parts) = value.into_array().map(Vec::into_iter) else {
                continue;
            };
            let kind = parts.next().and_then(RespValue::into_string);
            let channel = parts.next().and_then(RespValue::into_string);
            let (Some(kind), Some(channel)) = (kind, channel) else {
                continue;
            };
            match kind.as_str() {
                "message" => {
                    let payload = parts.next().and_then(RespValue::into_bytes).unwrap_or_default();
                    let handlers: Vec<MessageHandler> = lock(&self.inner.channels)
                        .handlers
                        .get(&channel)
                        .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
                        .unwrap_or_default();
                    for handler in handlers {
                        handler(channel.as_str(), payload.clone());
                    }
                }
                "subscribe" => {
                    let waiters = lock(&self.inner.channels).pending_acks.remove(&channel);
                    for waiter in waiters.into_iter().flatten() {
                        let _ = waiter.send(());
                    }
                }
                _ => {}
            }
        };

        let dropped = {
            let mut channels = lock(&self.inner.channels);
            channels.pending_acks.clear();
            std::mem::take(&mut channels.handlers)
        };
        if !dropped.is_empty() {
            tracing::warn!(
                channels = dropped.len(),
                error = %err,
                "pub/sub connection lost; subscriptions dropped"
            );
        }
        self.inner.pubsub.lock().await.take();
        self.connection_lost(&err);
    }
}

#[async_trait]
impl Store for RemoteStore {
    fn endpoint(&self) -> String {
        self.inner.config.endpoint()
    }

    /// False once a redial has failed. A socket dropped after a timeout still counts as
    /// connected while the next dial can replace it.
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        match self.execute(Command::new("GET").text(key)).await?.into_result()? {
            RespValue::Bulk(value) => Ok(value),
            _ => Err(unexpected("GET")),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), Error> {
        let millis = ttl.as_millis().max(1);
        self.execute(Command::new("SET").text(key).arg(value).text("PX").int(millis))
            .await?
            .into_result()?;
        Ok(())
    }

    async fn set_batch(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<(), Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let millis = ttl.as_millis().max(1);
        let mut commands = Vec::with_capacity(entries.len() + 2);
        commands.push(Command::new("MULTI"));
        for (key, value) in entries {
            commands.push(Command::new("SET").arg(key).arg(value).text("PX").int(millis));
        }
        commands.push(Command::new("EXEC"));
        let replies = self.execute_all(commands).await?;
        match replies.into_iter().last().map(RespValue::into_result) {
            Some(Ok(RespValue::Array(Some(_)))) => Ok(()),
            Some(Ok(RespValue::Array(None))) => Err(Error::new(ErrorKind::StoreUnavailable)
                .with_message("batch aborted by server; no keys were set")),
            Some(Err(err)) => Err(err),
            _ => Err(unexpected("EXEC")),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, Error> {
        if keys.is_empty() {
            return Ok(0);
        }
        let command = keys
            .iter()
            .fold(Command::new("DEL"), |command, key| command.text(key));
        integer_reply(self.execute(command).await?, "DEL")
    }

    async fn key_exists(&self, key: &str) -> Result<bool, Error> {
        let count = integer_reply(self.execute(Command::new("EXISTS").text(key)).await?, "EXISTS")?;
        Ok(count > 0)
    }

    async fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> Result<KeyPage, Error> {
        let reply = self
            .execute(
                Command::new("SCAN")
                    .int(cursor)
                    .text("MATCH")
                    .text(pattern)
                    .text("COUNT")
                    .int(count.max(1)),
            )
            .await?
            .into_result()?;
        let mut parts = reply.into_array().ok_or_else(|| unexpected("SCAN"))?.into_iter();
        let next_cursor = parts
            .next()
            .and_then(RespValue::into_string)
            .and_then(|cursor| cursor.parse().ok())
            .ok_or_else(|| unexpected("SCAN"))?;
        let keys = parts
            .next()
            .and_then(RespValue::into_array)
            .unwrap_or_default()
            .into_iter()
            .filter_map(RespValue::into_string)
            .collect();
        Ok(KeyPage { next_cursor, keys })
    }

    async fn list_push_front(&self, key: &str, value: Bytes) -> Result<u64, Error> {
        integer_reply(
            self.execute(Command::new("LPUSH").text(key).arg(value)).await?,
            "LPUSH",
        )
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>, Error> {
        let reply = self
            .execute(Command::new("LRANGE").text(key).int(start).int(stop))
            .await?
            .into_result()?;
        Ok(reply
            .into_array()
            .ok_or_else(|| unexpected("LRANGE"))?
            .into_iter()
            .map(|item| item.into_bytes().unwrap_or_default())
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<u64, Error> {
        integer_reply(self.execute(Command::new("LLEN").text(key)).await?, "LLEN")
    }

    async fn list_index(&self, key: &str, index: i64) -> Result<Option<Bytes>, Error> {
        match self
            .execute(Command::new("LINDEX").text(key).int(index))
            .await?
            .into_result()?
        {
            RespValue::Bulk(value) => Ok(value),
            _ => Err(unexpected("LINDEX")),
        }
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), Error> {
        self.execute(Command::new("LTRIM").text(key).int(start).int(stop))
            .await?
            .into_result()?;
        Ok(())
    }

    async fn stream_read(
        &self,
        key: &str,
        after: &StreamPosition,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Error> {
        let reply = self
            .execute(
                Command::new("XREAD")
                    .text("COUNT")
                    .int(count.max(1))
                    .text("STREAMS")
                    .text(key)
                    .text(after.as_str()),
            )
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::Timeout => err,
                _ if err.is_transient() => Error::new(ErrorKind::TransientRead)
                    .with_message("stream read failed")
                    .with_source(err),
                _ => err,
            })?
            .into_result()?;
        parse_stream_reply(reply)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, Error> {
        integer_reply(
            self.execute(Command::new("PUBLISH").text(channel).arg(payload))
                .await?,
            "PUBLISH",
        )
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<HandlerId, Error> {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::SeqCst) + 1);
        let ack = {
            let mut channels = lock(&self.inner.channels);
            let entry = channels.handlers.entry(channel.to_string()).or_default();
            entry.push((id, handler));
            if entry.len() > 1 {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                channels
                    .pending_acks
                    .entry(channel.to_string())
                    .or_default()
                    .push(tx);
                Some(rx)
            }
        };
        let Some(ack) = ack else {
            return Ok(id);
        };

        let confirmed = async {
            self.send_pubsub(Command::new("SUBSCRIBE").text(channel)).await?;
            tokio::time::timeout(self.inner.config.request_timeout, ack)
                .await
                .map_err(|_| {
                    Error::new(ErrorKind::Timeout).with_message("SUBSCRIBE timed out")
                })?
                .map_err(|_| {
                    Error::new(ErrorKind::StoreUnavailable)
                        .with_message("pub/sub connection closed before SUBSCRIBE was confirmed")
                })
        };
        if let Err(err) = confirmed.await {
            lock(&self.inner.channels).pending_acks.remove(channel);
            self.remove_handler(channel, id);
            return Err(err);
        }
        Ok(id)
    }

    async fn unsubscribe_handler(&self, channel: &str, id: HandlerId) -> Result<(), Error> {
        if self.remove_handler(channel, id) {
            self.send_unsubscribe(channel).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), Error> {
        let removed = lock(&self.inner.channels).handlers.remove(channel).is_some();
        if removed {
            self.send_unsubscribe(channel).await?;
        }
        Ok(())
    }
}

impl RemoteStore {
    /// Returns true when the channel has no handlers left.
    fn remove_handler(&self, channel: &str, id: HandlerId) -> bool {
        let mut channels = lock(&self.inner.channels);
        let Some(handlers) = channels.handlers.get_mut(channel) else {
            return false;
        };
        handlers.retain(|(existing, _)| *existing != id);
        if handlers.is_empty() {
            channels.handlers.remove(channel);
            true
        } else {
            false
        }
    }

    async fn send_unsubscribe(&self, channel: &str) -> ApiResult<()> {
        if self.inner.pubsub.lock().await.is_none() {
            return Ok(());
        }
        self.send_pubsub(Command::new("UNSUBSCRIBE").text(channel))
            .await
    }
}

impl fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore")
            .field("endpoint", &self.inner.config.endpoint())
            .field("connected", &self.is_connected())
            .field("reconnects", &self.inner.reconnects.load(Ordering::SeqCst))
            .finish()
    }
}

fn integer_reply(reply: RespValue, command: &str) -> ApiResult<u64> {
    let value = reply.into_result()?;
    value
        .as_integer()
        .and_then(|value| u64::try_from(value).ok())
        .ok_or_else(|| unexpected(command))
}

fn parse_stream_reply(reply: RespValue) -> ApiResult<Vec<StreamEntry>> {
    let streams = match reply {
        RespValue::Array(Some(streams)) => streams,
        RespValue::Array(None) | RespValue::Bulk(None) => return Ok(Vec::new()),
        _ => return Err(unexpected("XREAD")),
    };
    let mut entries = Vec::new();
    for stream in streams {
        let mut parts = stream.into_array().ok_or_else(|| unexpected("XREAD"))?.into_iter();
        let _name = parts.next();
        let items = parts
            .next()
            .and_then(RespValue::into_array)
            .ok_or_else(|| unexpected("XREAD"))?;
        for item in items {
            let mut item = item.into_array().ok_or_else(|| unexpected("XREAD"))?.into_iter();
            let id = item
                .next()
                .and_then(RespValue::into_string)
                .ok_or_else(|| unexpected("XREAD"))?;
            let mut raw = item
                .next()
                .and_then(RespValue::into_array)
                .unwrap_or_default()
                .into_iter();
            let mut fields = Vec::new();
            while let (Some(name), Some(value)) = (raw.next(), raw.next()) {
                fields.push((
                    name.into_string().unwrap_or_default(),
                    value.into_bytes().unwrap_or_default(),
                ));
            }
            entries.push(StreamEntry::new(StreamPosition::new(id), fields));
        }
    }
    Ok(entries)
}
