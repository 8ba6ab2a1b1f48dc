// CLI integration tests: JSON output, exit codes, and error shapes against a fake store.
mod common;

use std::process::{Command, Output};

use common::FakeRedis;
use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_cachelink");
    let mut command = Command::new(exe);
    command.env_remove("CACHELINK_URL").env("RUST_LOG", "warn");
    command
}

fn run(server: &FakeRedis, args: &[&str]) -> Output {
    cmd()
        .args(["--url", &server.url(), "--timeout", "2s"])
        .args(args)
        .output()
        .expect("run cachelink")
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

/// Diagnostics may precede it on stderr; the error document is always the last line.
fn parse_error(stderr: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stderr);
    let line = text.lines().last().expect("error line");
    let value: Value = serde_json::from_str(line).expect("valid json");
    assert!(value.get("error").is_some(), "not an error document: {line}");
    value
}

fn json_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json"))
        .collect()
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

#[test]
fn help_exits_zero() {
    let output = cmd().arg("--help").output().expect("help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("EXAMPLES"));
    assert!(stdout.contains("CACHELINK_URL"));
}

#[test]
fn bad_duration_is_a_usage_error() {
    let output = cmd()
        .args(["set", "k", "1", "--ttl", "soon"])
        .output()
        .expect("set");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_error(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(err["error"]["hint"].as_str().is_some());
}

#[test]
fn unreachable_store_exits_with_store_unavailable() {
    let port = closed_port();
    let output = cmd()
        .args(["--url", &format!("redis://127.0.0.1:{port}"), "ping"])
        .output()
        .expect("ping");
    assert_eq!(output.status.code(), Some(3));
    let err = parse_error(&output.stderr);
    assert_eq!(err["error"]["kind"], "StoreUnavailable");
    assert!(err["error"]["causes"].as_array().is_some_and(|causes| !causes.is_empty()));
}

#[test]
fn invalid_url_is_a_usage_error() {
    let output = cmd()
        .args(["--url", "http://localhost", "ping"])
        .output()
        .expect("ping");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_error(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
}

#[test]
fn set_get_del_flow() {
    let server = FakeRedis::start();

    let set = run(&server, &["set", "session:1", r#"{"user":"ada"}"#, "--ttl", "10m"]);
    assert!(set.status.success());
    let set_json = parse_json_line(&set.stdout);
    assert_eq!(set_json["ttl_ms"], 600_000);
    assert_eq!(server.state().expiries_ms.get("session:1"), Some(&600_000));

    let get = run(&server, &["get", "session:1"]);
    assert!(get.status.success());
    let get_json = parse_json_line(&get.stdout);
    assert_eq!(get_json["found"], true);
    assert_eq!(get_json["value"]["user"], "ada");

    let del = run(&server, &["del", "session:1", "session:2"]);
    assert!(del.status.success());

    let missing = run(&server, &["get", "session:1"]);
    let missing_json = parse_json_line(&missing.stdout);
    assert_eq!(missing_json["found"], false);
    assert_eq!(missing_json["value"], Value::Null);
}

#[test]
fn set_rejects_invalid_json() {
    let server = FakeRedis::start();
    let output = run(&server, &["set", "k", "{not json"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(server.state().strings.is_empty());
}

#[test]
fn get_decode_error_does_not_echo_the_payload() {
    let server = FakeRedis::start();
    server.state().strings.insert(
        "card".to_string(),
        bytes::Bytes::from_static(br#"{"pan": card-4111-1111}"#),
    );

    let output = run(&server, &["get", "card"]);
    assert_eq!(output.status.code(), Some(8));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("4111"), "payload leaked: {stderr}");
    let err = parse_error(&output.stderr);
    assert_eq!(err["error"]["kind"], "Deserialization");
    assert_eq!(err["error"]["key"], "card");
    assert_eq!(err["error"]["payload_len"], 23);
    assert!(err["error"].get("causes").is_none());
}

#[test]
fn keys_prints_one_json_line_per_key() {
    let server = FakeRedis::start();
    for key in ["user:1", "user:2", "order:1"] {
        assert!(run(&server, &["set", key, "true"]).status.success());
    }

    let output = run(&server, &["keys", "user:*"]);
    assert!(output.status.success());
    let mut keys: Vec<String> = json_lines(&output.stdout)
        .into_iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["user:1", "user:2"]);
}

#[test]
fn lpush_and_lrange_with_negative_indexes() {
    let server = FakeRedis::start();
    for value in ["1", "2", "3"] {
        let push = run(&server, &["lpush", "nums", value]);
        assert!(push.status.success());
    }

    let output = run(&server, &["lrange", "nums", "-2", "-1"]);
    assert!(output.status.success());
    let json = parse_json_line(&output.stdout);
    assert_eq!(json["items"], serde_json::json!([2, 1]));
}

#[test]
fn publish_without_subscribers_reports_zero() {
    let server = FakeRedis::start();
    let output = run(&server, &["publish", "alerts", r#"{"sev":1}"#]);
    assert!(output.status.success());
    assert_eq!(parse_json_line(&output.stdout)["receivers"], 0);
}

#[test]
fn wait_times_out_with_exit_code() {
    let server = FakeRedis::start();
    let output = run(&server, &["wait", "alerts", "--timeout", "200ms"]);
    assert_eq!(output.status.code(), Some(5));
    let err = parse_error(&output.stderr);
    assert_eq!(err["error"]["kind"], "Timeout");
    assert_eq!(err["error"]["key"], "alerts");
}

#[test]
fn tail_stops_after_max_items() {
    let server = FakeRedis::start();
    server.stream_add("events", "1-0", r#"{"n":1}"#);
    server.stream_add("events", "2-0", r#"{"n":2}"#);
    server.stream_add("events", "3-0", r#"{"n":3}"#);

    let output = run(&server, &["tail", "events", "--from", "1-0", "--max", "2"]);
    assert!(output.status.success());
    let items = json_lines(&output.stdout);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["n"], 2);
    assert_eq!(items[1]["n"], 3);
}

#[test]
fn tail_must_exist_fails_for_missing_stream() {
    let server = FakeRedis::start();
    let output = run(&server, &["tail", "ghost", "--must-exist"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.lines().count() >= 2, "expected a warning before the error");
    let err = parse_error(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert_eq!(err["error"]["key"], "ghost");
}

#[test]
fn ping_reports_endpoint() {
    let server = FakeRedis::start();
    let output = run(&server, &["ping"]);
    assert!(output.status.success());
    let json = parse_json_line(&output.stdout);
    assert_eq!(json["connected"], true);
    assert_eq!(
        json["endpoint"],
        format!("redis://127.0.0.1:{}/0", server.port())
    );
}
