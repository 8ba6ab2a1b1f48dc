//! Purpose: `cachelink` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, drives one `Client` against a remote store.
//! Invariants: Commands emit JSON on stdout (one document per line for streaming commands).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Ctrl-C ends `subscribe` and `tail` cleanly with exit code 0.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::time::Duration;

use clap::{Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use cachelink::api::{
    CacheConsumer, CacheKeys, CacheProvider, CacheState, CacheSubscription, Cancellation, Client,
    ConnectionRestored, ConsumeSettings, Error, ErrorKind, ListProvider, RemoteConfig,
    RemoteConnector, RestoreListener, SinkPolicy, message_channel, to_exit_code,
};

const DURATION_HINT: &str = "Use a number plus ms|s|m|h (e.g. 10s).";

#[derive(Parser, Debug)]
#[command(
    name = "cachelink",
    version,
    about = "Cache, list, pub/sub, and stream operations against a Redis-compatible store",
    after_help = r#"EXAMPLES
  $ cachelink set session:42 '{"user": "ada"}' --ttl 10m
  $ cachelink get session:42
  $ cachelink keys 'session:*'
  $ cachelink subscribe alerts             # Terminal 1: waits for messages
  $ cachelink publish alerts '{"sev": 1}'  # Terminal 2
  $ cachelink tail events --from 0-0

ENVIRONMENT
  CACHELINK_URL   store url used when --url is not given
  RUST_LOG        log filter for stderr diagnostics (default: info)"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        env = "CACHELINK_URL",
        default_value = "redis://127.0.0.1:6379",
        help = "Store url: redis://[:password@]host[:port][/db]"
    )]
    url: String,
    #[arg(
        long,
        default_value = "5s",
        value_parser = parse_duration,
        help = "Connect and per-request timeout (ms|s|m|h)"
    )]
    timeout: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Read a cached JSON value")]
    Get { key: String },
    #[command(about = "Cache a JSON value with an expiry")]
    Set {
        key: String,
        #[arg(help = "JSON value")]
        value: String,
        #[arg(long, default_value = "1h", value_parser = parse_duration)]
        ttl: Duration,
    },
    #[command(about = "Delete keys (missing keys are ignored)")]
    Del {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    #[command(about = "List keys matching a glob pattern")]
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },
    #[command(about = "Push a JSON value onto the head of a list")]
    Lpush {
        key: String,
        #[arg(help = "JSON value")]
        value: String,
    },
    #[command(about = "Read an inclusive index window of a list")]
    Lrange {
        key: String,
        #[arg(default_value_t = 0, allow_negative_numbers = true)]
        start: i64,
        #[arg(default_value_t = -1, allow_negative_numbers = true)]
        stop: i64,
    },
    #[command(about = "Publish a JSON message to a channel")]
    Publish {
        channel: String,
        #[arg(help = "JSON message")]
        message: String,
    },
    #[command(about = "Wait for the next message on a channel")]
    Wait {
        channel: String,
        #[arg(long, value_parser = parse_duration, help = "Give up after this long")]
        timeout: Option<Duration>,
    },
    #[command(about = "Print messages from a channel until Ctrl-C")]
    Subscribe {
        channel: String,
        #[arg(long, help = "Bound the local queue; extra messages are dropped")]
        capacity: Option<usize>,
    },
    #[command(about = "Follow a stream from a position until Ctrl-C")]
    Tail {
        stream: String,
        #[arg(long, default_value = "0-0", help = "Read entries after this id")]
        from: String,
        #[arg(long, default_value_t = ConsumeSettings::DEFAULT_PREFETCH)]
        prefetch: usize,
        #[arg(long, help = "Fail instead of waiting when the stream does not exist")]
        must_exist: bool,
        #[arg(long, help = "Exit after this many items")]
        max: Option<usize>,
    },
    #[command(about = "Check that the store is reachable")]
    Ping,
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let missing = err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand;
                return Ok(if missing { 2 } else { 0 });
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `cachelink --help`."));
            }
        },
    };

    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(dispatch(cli))?;
    Ok(0)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

async fn dispatch(cli: Cli) -> Result<(), Error> {
    let config = RemoteConfig::from_url(&cli.url)?
        .with_connect_timeout(cli.timeout)
        .with_request_timeout(cli.timeout);
    let client = Client::new(RemoteConnector::new(config));

    match cli.command {
        Command::Get { key } => {
            let value: Option<Value> = client.try_get(&key).await?;
            emit_json(&json!({ "key": key, "found": value.is_some(), "value": value }));
        }
        Command::Set { key, value, ttl } => {
            let value = parse_json_arg(&value)?;
            client.set(&key, &value, ttl).await?;
            emit_json(&json!({ "key": key, "ttl_ms": ttl.as_millis() as u64 }));
        }
        Command::Del { keys } => {
            client.delete_many(&keys).await?;
            emit_json(&json!({ "deleted": keys }));
        }
        Command::Keys { pattern } => {
            let mut scan = client.keys(&pattern);
            while let Some(key) = scan.next_key().await? {
                emit_json(&Value::String(key));
            }
        }
        Command::Lpush { key, value } => {
            let value = parse_json_arg(&value)?;
            let len = client.list_left_push(&key, &value).await?;
            emit_json(&json!({ "key": key, "len": len }));
        }
        Command::Lrange { key, start, stop } => {
            let items: Vec<Value> = client.list_range(&key, start, stop).await?;
            emit_json(&json!({ "key": key, "items": items }));
        }
        Command::Publish { channel, message } => {
            let message = parse_json_arg(&message)?;
            let receivers = client.publish(&channel, &message).await?;
            emit_json(&json!({ "channel": channel, "receivers": receivers }));
        }
        Command::Wait { channel, timeout } => {
            let cancel = cancel_on_ctrl_c();
            let wait = client.wait_one::<Value>(&channel);
            let message = match timeout {
                Some(limit) => tokio::select! {
                    message = tokio::time::timeout(limit, wait) => message.map_err(|_| {
                        Error::new(ErrorKind::Timeout)
                            .with_message("no message received")
                            .with_key(channel.as_str())
                    })??,
                    _ = cancel.cancelled() => return Ok(()),
                },
                None => tokio::select! {
                    message = wait => message?,
                    _ = cancel.cancelled() => return Ok(()),
                },
            };
            emit_json(&message);
        }
        Command::Subscribe { channel, capacity } => {
            subscribe(&client, &channel, capacity).await?;
        }
        Command::Tail {
            stream,
            from,
            prefetch,
            must_exist,
            max,
        } => {
            let settings = ConsumeSettings::new(prefetch, from.as_str())?;
            let cancel = cancel_on_ctrl_c();
            let mut tail = if must_exist {
                client
                    .try_consume_stream::<Value>(&stream, settings, cancel)
                    .await
                    .ok_or_else(|| {
                        Error::new(ErrorKind::Usage)
                            .with_message("stream is missing or the store is disconnected")
                            .with_key(stream.as_str())
                            .with_hint("Drop --must-exist to wait for the stream to appear.")
                    })?
            } else {
                client.consume_stream::<Value>(&stream, settings, cancel)
            };
            let mut emitted = 0usize;
            while let Some(item) = tail.next().await {
                emit_json(&item);
                emitted += 1;
                if max.is_some_and(|max| emitted >= max) {
                    break;
                }
            }
        }
        Command::Ping => {
            let endpoint = client.connection().store().await?.endpoint();
            if !client.is_connected().await {
                return Err(Error::new(ErrorKind::StoreUnavailable)
                    .with_message("store is not reachable")
                    .with_key(endpoint));
            }
            emit_json(&json!({ "endpoint": endpoint, "connected": true }));
        }
    }
    Ok(())
}

async fn subscribe(client: &Client, channel: &str, capacity: Option<usize>) -> Result<(), Error> {
    let policy = capacity.map_or(SinkPolicy::Grow, |capacity| SinkPolicy::DropNewest {
        capacity,
    });
    let (sink, mut receiver) = message_channel::<Value>(policy);
    let mut restored = Some(client.on_connection_restored());
    let cancel = cancel_on_ctrl_c();
    let mut subscription = client.subscribe(channel, sink.clone()).await?;

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(message) => emit_json(&message),
                None => break,
            },
            event = next_restore(&mut restored) => {
                tracing::info!(channel, reconnects = event.reconnects, "resubscribing after reconnect");
                subscription = client.subscribe(channel, sink.clone()).await?;
            }
            _ = cancel.cancelled() => break,
        }
    }

    if receiver.dropped() > 0 {
        tracing::warn!(dropped = receiver.dropped(), "messages dropped by the bounded queue");
    }
    subscription.close().await
}

/// Next restore event. Once the listener has closed this never resolves.
async fn next_restore(restored: &mut Option<RestoreListener>) -> ConnectionRestored {
    if let Some(listener) = restored.as_mut() {
        if let Some(event) = listener.recv().await {
            return event;
        }
    }
    *restored = None;
    std::future::pending().await
}

fn cancel_on_ctrl_c() -> Cancellation {
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn parse_json_arg(raw: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("argument is not valid JSON")
            .with_hint("Quote JSON strings, e.g. '\"hello\"'.")
            .with_source(err)
    })
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint(DURATION_HINT)
    };
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .ok_or_else(invalid)?;
    let (num_str, unit) = trimmed.split_at(split);
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    if millis == 0 {
        return Err(invalid().with_message("duration must be greater than zero"));
    }
    Ok(Duration::from_millis(millis))
}

fn emit_json(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::StoreUnavailable => "store unavailable",
        ErrorKind::TransientRead => "read failed",
        ErrorKind::Timeout => "timed out",
        ErrorKind::Protocol => "protocol error",
        ErrorKind::Serialization => "failed to encode value",
        ErrorKind::Deserialization => "failed to decode value",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(type_name) = err.type_name() {
        inner.insert("type".to_string(), json!(type_name));
    }
    if let Some(len) = err.payload_len() {
        inner.insert("payload_len".to_string(), json!(len));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json, error_text, next_restore, parse_duration};
    use cachelink::api::{Client, Error, ErrorKind, MemoryStore};
    use clap::Parser;
    use std::time::Duration;

    #[test]
    fn parse_duration_accepts_ms_s_m_h() {
        assert_eq!(parse_duration("250ms").expect("ms"), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").expect("s"), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").expect("m"), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").expect("h"), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        for input in ["", "10", "s", "10x", "0s"] {
            let err = parse_duration(input).expect_err(input);
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn error_json_carries_context_but_not_payload() {
        let err = Error::new(ErrorKind::Deserialization)
            .with_message("invalid json payload")
            .with_key("orders:1")
            .with_type_name("Order")
            .with_payload_len(12);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Deserialization");
        assert_eq!(value["error"]["key"], "orders:1");
        assert_eq!(value["error"]["type"], "Order");
        assert_eq!(value["error"]["payload_len"], 12);
        assert!(error_text(&err).starts_with("error: invalid json payload"));
    }

    #[tokio::test]
    async fn closed_restore_listener_stays_pending() {
        let client = Client::new(MemoryStore::new());
        let mut restored = Some(client.on_connection_restored());
        drop(client);

        let waited =
            tokio::time::timeout(Duration::from_millis(50), next_restore(&mut restored)).await;
        assert!(waited.is_err());
        assert!(restored.is_none());
    }

    #[test]
    fn negative_list_indexes_parse() {
        let cli = Cli::try_parse_from(["cachelink", "lrange", "l", "-3", "-1"]).expect("parse");
        let rendered = format!("{:?}", cli.command);
        assert!(rendered.contains("start: -3"));
        assert!(rendered.contains("stop: -1"));
    }
}
