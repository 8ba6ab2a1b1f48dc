//! Purpose: Loopback fake of a Redis-compatible server for integration tests.
//! Exports: `FakeRedis`, `FakeState`, `TestResult`.
//! Role: Speaks enough RESP2 for every command the remote store issues.
//! Invariants: Runs on its own thread and runtime so sync CLI tests can use it too.
//! Invariants: Fault hooks (dropped connections, stalled replies, aborted EXEC) are one-shot.
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use cachelink::core::position::StreamPosition;
use cachelink::core::resp::{RespValue, decode_reply};
use cachelink::core::store::{glob_match, normalize_range};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Default)]
pub struct FakeState {
    pub password: Option<String>,
    pub strings: HashMap<String, Bytes>,
    pub expiries_ms: HashMap<String, u64>,
    pub lists: HashMap<String, VecDeque<Bytes>>,
    pub streams: HashMap<String, Vec<(String, Vec<(Bytes, Bytes)>)>>,
    pub commands: Vec<String>,
    pub stall_next: HashSet<String>,
    pub abort_next_exec: bool,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>,
}

impl FakeState {
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers.get(channel).map_or(0, Vec::len)
    }
}

pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    kill: Arc<watch::Sender<u64>>,
}

impl FakeRedis {
    pub fn start() -> Self {
        Self::start_with_password(None)
    }

    pub fn start_with_password(password: Option<&str>) -> Self {
        let state = Arc::new(Mutex::new(FakeState {
            password: password.map(str::to_string),
            ..FakeState::default()
        }));
        let (kill, _) = watch::channel(0u64);
        let kill = Arc::new(kill);
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();

        let thread_state = Arc::clone(&state);
        let thread_kill = Arc::clone(&kill);
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
                addr_tx
                    .send(listener.local_addr().expect("local addr"))
                    .expect("send addr");
                let mut next_id = 0u64;
                while let Ok((stream, _)) = listener.accept().await {
                    next_id += 1;
                    tokio::spawn(serve_connection(
                        stream,
                        next_id,
                        Arc::clone(&thread_state),
                        thread_kill.subscribe(),
                    ));
                }
            });
        });

        let addr = addr_rx.recv().expect("fake server address");
        Self { addr, state, kill }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Close every open client connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    pub fn stream_add(&self, key: &str, id: &str, value: &str) {
        self.state()
            .streams
            .entry(key.to_string())
            .or_default()
            .push((
                id.to_string(),
                vec![(
                    Bytes::from_static(b"value"),
                    Bytes::copy_from_slice(value.as_bytes()),
                )],
            ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    id: u64,
    state: Arc<Mutex<FakeState>>,
    mut kill: watch::Receiver<u64>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut session = Session {
        id,
        authed: lock(&state).password.is_none(),
        queued: None,
        push: push_tx,
    };
    let mut buf = BytesMut::with_capacity(4096);

    'conn: loop {
        tokio::select! {
            _ = kill.changed() => break,
            Some(frame) = push_rx.recv() => {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            read = reader.read_buf(&mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    break;
                }
                while let Ok(Some(value)) = decode_reply(&mut buf) {
                    let args = command_args(value);
                    let name = args
                        .first()
                        .map(|name| String::from_utf8_lossy(name).to_uppercase())
                        .unwrap_or_default();
                    let stall = lock(&state).stall_next.remove(&name);
                    let reply = handle(&state, &mut session, &name, &args);
                    if stall {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    if writer.write_all(&reply).await.is_err() {
                        break 'conn;
                    }
                }
            }
        }
    }

    let mut state = lock(&state);
    for subscribers in state.subscribers.values_mut() {
        subscribers.retain(|(owner, _)| *owner != id);
    }
    state.subscribers.retain(|_, subscribers| !subscribers.is_empty());
}

struct Session {
    id: u64,
    authed: bool,
    queued: Option<Vec<(String, Vec<Bytes>)>>,
    push: mpsc::UnboundedSender<Vec<u8>>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn command_args(value: RespValue) -> Vec<Bytes> {
    value
        .into_array()
        .unwrap_or_default()
        .into_iter()
        .filter_map(RespValue::into_bytes)
        .collect()
}

fn handle(
    state: &Mutex<FakeState>,
    session: &mut Session,
    name: &str,
    args: &[Bytes],
) -> Vec<u8> {
    lock(state).commands.push(name.to_string());

    if name == "AUTH" {
        let expected = lock(state).password.clone();
        let given = args.last().map(|arg| String::from_utf8_lossy(arg).into_owned());
        return if expected.is_some() && expected == given {
            session.authed = true;
            simple("OK")
        } else {
            error("WRONGPASS invalid username-password pair or user is disabled.")
        };
    }
    if !session.authed {
        return error("NOAUTH Authentication required.");
    }

    if let Some(queued) = session.queued.as_mut() {
        match name {
            "EXEC" => {
                let queued = session.queued.take().unwrap_or_default();
                let mut guard = lock(state);
                if std::mem::take(&mut guard.abort_next_exec) {
                    return b"*-1\r\n".to_vec();
                }
                let replies = queued
                    .iter()
                    .map(|(name, args)| execute(&mut guard, session, name, args))
                    .collect();
                return array(replies);
            }
            "MULTI" => return error("ERR MULTI calls can not be nested"),
            _ => {
                queued.push((name.to_string(), args.to_vec()));
                return simple("QUEUED");
            }
        }
    }
    if name == "MULTI" {
        session.queued = Some(Vec::new());
        return simple("OK");
    }

    let mut guard = lock(state);
    execute(&mut guard, session, name, args)
}

fn execute(state: &mut FakeState, session: &Session, name: &str, args: &[Bytes]) -> Vec<u8> {
    let text = |idx: usize| {
        args.get(idx)
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .unwrap_or_default()
    };
    let number = |idx: usize| text(idx).parse::<i64>().unwrap_or(0);

    match name {
        "PING" => simple("PONG"),
        "SELECT" => simple("OK"),
        "GET" => bulk(state.strings.get(&text(1)).map(|value| &value[..])),
        "SET" => {
            let key = text(1);
            if text(3).eq_ignore_ascii_case("PX") {
                state.expiries_ms.insert(key.clone(), number(4) as u64);
            }
            state
                .strings
                .insert(key, args.get(2).cloned().unwrap_or_default());
            simple("OK")
        }
        "DEL" => {
            let removed = (1..args.len())
                .filter(|idx| {
                    let key = text(*idx);
                    state.strings.remove(&key).is_some() | state.lists.remove(&key).is_some()
                })
                .count();
            int(removed as i64)
        }
        "EXISTS" => {
            let key = text(1);
            let exists = state.strings.contains_key(&key)
                || state.lists.contains_key(&key)
                || state.streams.contains_key(&key);
            int(i64::from(exists))
        }
        "SCAN" => {
            let pattern = text(3);
            let mut keys: Vec<String> = state
                .strings
                .keys()
                .chain(state.lists.keys())
                .chain(state.streams.keys())
                .filter(|key| glob_match(&pattern, key))
                .cloned()
                .collect();
            keys.sort();
            array(vec![
                bulk(Some(b"0")),
                array(keys.iter().map(|key| bulk(Some(key.as_bytes()))).collect()),
            ])
        }
        "LPUSH" => {
            let list = state.lists.entry(text(1)).or_default();
            for value in &args[2..] {
                list.push_front(value.clone());
            }
            int(list.len() as i64)
        }
        "LRANGE" => {
            let items = state
                .lists
                .get(&text(1))
                .and_then(|list| {
                    normalize_range(list.len(), number(2), number(3))
                        .map(|(from, to)| list.range(from..=to).cloned().collect::<Vec<_>>())
                })
                .unwrap_or_default();
            array(items.iter().map(|item| bulk(Some(item))).collect())
        }
        "LLEN" => int(state.lists.get(&text(1)).map_or(0, |list| list.len() as i64)),
        "LINDEX" => {
            let value = state.lists.get(&text(1)).and_then(|list| {
                let index = number(2);
                let index = if index < 0 { list.len() as i64 + index } else { index };
                usize::try_from(index).ok().and_then(|index| list.get(index))
            });
            bulk(value.map(|value| &value[..]))
        }
        "LTRIM" => {
            let key = text(1);
            if let Some(list) = state.lists.get_mut(&key) {
                match normalize_range(list.len(), number(2), number(3)) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => {
                        state.lists.remove(&key);
                    }
                }
            }
            simple("OK")
        }
        "XREAD" => {
            let count = number(2).max(1) as usize;
            let key = text(4);
            let after = StreamPosition::new(text(5));
            let entries: Vec<Vec<u8>> = state
                .streams
                .get(&key)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(id, _)| StreamPosition::new(id.as_str()) > after)
                        .take(count)
                        .map(|(id, fields)| {
                            let flat = fields
                                .iter()
                                .flat_map(|(name, value)| [bulk(Some(name)), bulk(Some(value))])
                                .collect();
                            array(vec![bulk(Some(id.as_bytes())), array(flat)])
                        })
                        .collect()
                })
                .unwrap_or_default();
            if entries.is_empty() {
                return b"*-1\r\n".to_vec();
            }
            array(vec![array(vec![bulk(Some(key.as_bytes())), array(entries)])])
        }
        "PUBLISH" => {
            let channel = text(1);
            let payload = args.get(2).cloned().unwrap_or_default();
            let frame = array(vec![
                bulk(Some(b"message")),
                bulk(Some(channel.as_bytes())),
                bulk(Some(&payload)),
            ]);
            let delivered = state
                .subscribers
                .get(&channel)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .filter(|(_, push)| push.send(frame.clone()).is_ok())
                        .count()
                })
                .unwrap_or(0);
            int(delivered as i64)
        }
        "SUBSCRIBE" => {
            let mut reply = Vec::new();
            for idx in 1..args.len() {
                let channel = text(idx);
                state
                    .subscribers
                    .entry(channel.clone())
                    .or_default()
                    .push((session.id, session.push.clone()));
                reply.extend(array(vec![
                    bulk(Some(b"subscribe")),
                    bulk(Some(channel.as_bytes())),
                    int(idx as i64),
                ]));
            }
            reply
        }
        "UNSUBSCRIBE" => {
            let mut reply = Vec::new();
            for idx in 1..args.len() {
                let channel = text(idx);
                if let Some(subscribers) = state.subscribers.get_mut(&channel) {
                    subscribers.retain(|(owner, _)| *owner != session.id);
                    if subscribers.is_empty() {
                        state.subscribers.remove(&channel);
                    }
                }
                reply.extend(array(vec![
                    bulk(Some(b"unsubscribe")),
                    bulk(Some(channel.as_bytes())),
                    int(0),
                ]));
            }
            reply
        }
        other => error(&format!("ERR unknown command '{other}'")),
    }
}

fn simple(text: &str) -> Vec<u8> {
    format!("+{text}\r\n").into_bytes()
}

fn error(text: &str) -> Vec<u8> {
    format!("-{text}\r\n").into_bytes()
}

fn int(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn bulk(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(value) => {
            let mut out = format!("${}\r\n", value.len()).into_bytes();
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
            out
        }
        None => b"$-1\r\n".to_vec(),
    }
}

fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend(item);
    }
    out
}
