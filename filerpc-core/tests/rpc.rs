use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use filerpc_core::permission::{PermissionRule, RuleFile};
use filerpc_core::server::ERROR_HEADER;
use filerpc_core::wire::{self, WriteMode};
use filerpc_core::{
    handler_fn, Address, Call, Context, DirFutureStore, FutureState, HandlerError, Json, Request,
    Right, Router, RpcError, Runtime, RuntimeConfig, SendOptions, ServerHandle, StatusCode,
};
use serde::Deserialize;

const BOB: &str = "bob@x";
const ALICE: &str = "alice@x";
const EVIL: &str = "evil@x";
const WAIT: Duration = Duration::from_secs(10);

fn config(root: &Path, identity: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(root, identity);
    config.poll_interval = Duration::from_millis(25);
    config.rescan_interval = Duration::from_millis(50);
    config
}

fn ping_url() -> Address {
    Address::rpc(BOB, "chat", "ping").unwrap()
}

fn ping_dir(root: &Path) -> PathBuf {
    root.join(BOB).join("api_data/chat/rpc/ping")
}

/// Bob serves `chat` with a `ping` route answering `pong:<body>`.
fn serve_ping(root: &Path, calls: Arc<AtomicUsize>) -> ServerHandle {
    let bob = Runtime::new(config(root, BOB));
    let mut server = bob.server("chat").unwrap();
    server
        .register(
            "ping",
            handler_fn(move |body: String, _ctx: Context| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(format!("pong:{body}"))
                }
            }),
        )
        .unwrap();
    server.start().unwrap()
}

async fn wait_for_file(path: &Path) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Enough time for several rescans to have passed over the rpc tree.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}

fn response_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("response"))
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_roundtrip() {
    let root = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = serve_ping(root.path(), calls.clone());

    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let future = alice
        .send(Call::new(ping_url(), "ping").body("hello"), SendOptions::default())
        .unwrap();
    let response = future.wait(WAIT).await.unwrap();

    assert_eq!(response.status_code, StatusCode::OK);
    assert_eq!(response.body(), b"pong:hello");
    assert_eq!(response.id(), future.id());
    assert_eq!(response.envelope.sender, BOB);
    assert_eq!(future.state(), FutureState::Resolved);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let rpc_dir = server.rpc_dir().to_path_buf();
    assert!(rpc_dir.join("syft.perm.toml").exists());
    let schema: serde_json::Value =
        serde_json::from_slice(&fs::read(rpc_dir.join("rpc.schema.json")).unwrap()).unwrap();
    assert_eq!(schema["endpoints"][0]["pattern"], "/ping");
    assert_eq!(
        schema["endpoints"][0]["url"],
        "syft://bob@x/api_data/chat/rpc/ping"
    );
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_sender_is_refused_before_the_handler() {
    let root = tempfile::tempdir().unwrap();
    let rpc_dir = root.path().join(BOB).join("api_data/chat/rpc");
    RuleFile {
        rules: vec![PermissionRule::new(ALICE, &[Right::Read, Right::Write], false)],
    }
    .save(&rpc_dir)
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let server = serve_ping(root.path(), calls.clone());

    let evil = Runtime::new(config(root.path(), EVIL)).client();
    let future = evil
        .send(Call::new(ping_url(), "ping").body("let me in"), SendOptions::default())
        .unwrap();
    let response = future.wait(WAIT).await.unwrap();
    assert_eq!(response.status_code, StatusCode::FORBIDDEN);
    assert_eq!(response.envelope.header(ERROR_HEADER), Some("PermissionDenied"));
    assert!(String::from_utf8_lossy(response.body()).contains("permission denied"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        response.error_for_status(),
        Err(RpcError::Remote { status: StatusCode::FORBIDDEN, .. })
    ));

    // The published rules were left alone and still admit alice.
    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let future = alice
        .send(Call::new(ping_url(), "ping").body("hi"), SendOptions::default())
        .unwrap();
    assert_eq!(future.wait(WAIT).await.unwrap().body(), b"pong:hi");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_request_files_are_skipped() {
    let root = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = serve_ping(root.path(), calls.clone());
    let dir = ping_dir(root.path());
    fs::create_dir_all(&dir).unwrap();

    let valid = Request::new(ALICE, ping_url(), "ping", "x", Duration::from_secs(60));
    let bytes = wire::encode_request(&valid).unwrap();
    let truncated = dir.join(wire::request_file_name(valid.id()));
    fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
    fs::write(dir.join("tiny.request"), b"FRP").unwrap();
    fs::write(dir.join("noise.request"), vec![0xabu8; 64]).unwrap();

    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let future = alice
        .send(Call::new(ping_url(), "ping").body("still alive"), SendOptions::default())
        .unwrap();
    assert_eq!(future.wait(WAIT).await.unwrap().body(), b"pong:still alive");
    settle().await;

    assert!(!dir.join(wire::response_file_name(valid.id())).exists());
    assert_eq!(response_files(&dir), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn each_request_id_is_answered_once() {
    let root = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = serve_ping(root.path(), calls.clone());

    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let future = alice
        .send(Call::new(ping_url(), "ping").body("once"), SendOptions::default())
        .unwrap();
    let first = future.wait(WAIT).await.unwrap();

    // Same envelope again under another name, and the original rewritten in place.
    let bytes = fs::read(future.request_path()).unwrap();
    let dir = ping_dir(root.path());
    fs::write(dir.join("copy.request"), &bytes).unwrap();
    fs::write(future.request_path(), &bytes).unwrap();
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(response_files(&dir), 1);
    let on_disk = wire::decode_response(&fs::read(future.response_path()).unwrap()).unwrap();
    assert_eq!(on_disk, first);
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_requests_get_419_without_running_the_handler() {
    let root = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = serve_ping(root.path(), calls.clone());
    let dir = ping_dir(root.path());
    fs::create_dir_all(&dir).unwrap();

    let stale = Request::new(ALICE, ping_url(), "ping", "late", Duration::ZERO);
    let path = dir.join(wire::request_file_name(stale.id()));
    wire::persist(&path, &wire::encode_request(&stale).unwrap(), WriteMode::NoClobber).unwrap();

    let response_path = dir.join(wire::response_file_name(stale.id()));
    assert!(wait_for_file(&response_path).await);
    let response = wire::decode_response(&fs::read(&response_path).unwrap()).unwrap();
    assert_eq!(response.status_code, StatusCode::EXPIRED);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    server.stop().await.unwrap();
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_failures_and_bad_bodies() {
    let root = tempfile::tempdir().unwrap();
    let bob = Runtime::new(config(root.path(), BOB));
    let greeted = Arc::new(AtomicUsize::new(0));
    let counter = greeted.clone();

    let mut server = bob.server("chat").unwrap();
    server
        .register(
            "fail",
            handler_fn(|_: (), _ctx: Context| async move {
                Err::<(), _>(HandlerError::from(anyhow::anyhow!("db password hunter2")))
            }),
        )
        .unwrap()
        .register(
            "greet",
            handler_fn(move |Json(g): Json<Greeting>, _ctx: Context| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(format!("hi {}", g.name))
                }
            }),
        )
        .unwrap()
        .register(
            "boom",
            handler_fn(|_: (), _ctx: Context| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<_, HandlerError>("unreachable")
            }),
        )
        .unwrap();
    let server = server.start().unwrap();

    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let call = |endpoint: &str, body: &str| {
        alice
            .send(
                Call::new(Address::rpc(BOB, "chat", endpoint).unwrap(), endpoint).body(body),
                SendOptions::default(),
            )
            .unwrap()
    };

    let failed = call("fail", "").wait(WAIT).await.unwrap();
    assert_eq!(failed.status_code, StatusCode::INTERNAL_ERROR);
    assert!(!String::from_utf8_lossy(failed.body()).contains("hunter2"));

    let panicked = call("boom", "").wait(WAIT).await.unwrap();
    assert_eq!(panicked.status_code, StatusCode::INTERNAL_ERROR);

    let bad = call("greet", "{not json").wait(WAIT).await.unwrap();
    assert_eq!(bad.status_code, StatusCode::BAD_REQUEST);
    assert_eq!(greeted.load(Ordering::SeqCst), 0);

    let good = call("greet", r#"{"name":"alice"}"#).wait(WAIT).await.unwrap();
    assert_eq!(good.body(), b"hi alice");
    assert_eq!(greeted.load(Ordering::SeqCst), 1);
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_routes_capture_params() {
    let root = tempfile::tempdir().unwrap();
    let bob = Runtime::new(config(root.path(), BOB));
    let mut users = Router::new();
    users
        .register(
            "{id}",
            handler_fn(|_: (), ctx: Context| async move {
                let id = ctx.param("id").unwrap_or("?").to_string();
                Ok::<_, HandlerError>(format!("user {id} seen by {}", ctx.sender()))
            }),
        )
        .unwrap();
    let mut server = bob.server("chat").unwrap();
    server.register_router("users", users).unwrap();
    let server = server.start().unwrap();

    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let url = Address::rpc(BOB, "chat", "users/42").unwrap();
    let response = alice
        .send(Call::new(url, "get"), SendOptions::default())
        .unwrap()
        .wait(WAIT)
        .await
        .unwrap();
    assert_eq!(response.body(), b"user 42 seen by alice@x");

    // No route for this endpoint: the request is left unanswered.
    let unrouted = alice
        .send(
            Call::new(Address::rpc(BOB, "chat", "nowhere").unwrap(), "get"),
            SendOptions::default(),
        )
        .unwrap();
    assert!(matches!(
        unrouted.wait(Duration::from_millis(300)).await,
        Err(RpcError::Timeout(_))
    ));
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_calls_share_one_request_until_expiry() {
    let root = tempfile::tempdir().unwrap();
    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let options = SendOptions::default()
        .cached()
        .expiry(Duration::from_millis(150));
    let call = || Call::new(ping_url(), "ping").body("same");

    let first = alice.send(call(), options.clone()).unwrap();
    let second = alice.send(call(), options.clone()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let written = fs::read_dir(ping_dir(root.path())).unwrap().count();
    assert_eq!(written, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let third = alice.send(call(), options).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_ne!(first.id(), third.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_timeout_is_local_to_the_caller() {
    let root = tempfile::tempdir().unwrap();
    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let future = alice
        .send(Call::new(ping_url(), "ping").body("patience"), SendOptions::default())
        .unwrap();

    let started = Instant::now();
    let err = future.wait(Duration::from_millis(200)).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, RpcError::Timeout(_)));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(200 + 25 + 400));
    assert_eq!(future.state(), FutureState::Pending);

    // A server started later still answers, and the same future resolves.
    let calls = Arc::new(AtomicUsize::new(0));
    let server = serve_ping(root.path(), calls);
    assert_eq!(future.wait(WAIT).await.unwrap().body(), b"pong:patience");
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_futures_survive_a_caller_restart() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();

    let id = {
        let store = Arc::new(DirFutureStore::open(state.path()).unwrap());
        let alice = Runtime::with_store(config(root.path(), ALICE), store).client();
        alice
            .send(Call::new(ping_url(), "ping").body("again"), SendOptions::default())
            .unwrap()
            .id()
    };

    let store = Arc::new(DirFutureStore::open(state.path()).unwrap());
    let alice = Runtime::with_store(config(root.path(), ALICE), store.clone()).client();
    let future = alice.load(id).unwrap().unwrap();
    assert_eq!(future.state(), FutureState::Pending);

    let server = serve_ping(root.path(), Arc::new(AtomicUsize::new(0)));
    assert_eq!(future.wait(WAIT).await.unwrap().body(), b"pong:again");
    assert!(store.ids().unwrap().is_empty());
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_server_answers_nothing() {
    let root = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    serve_ping(root.path(), calls.clone()).stop().await.unwrap();

    let alice = Runtime::new(config(root.path(), ALICE)).client();
    let future = alice
        .send(Call::new(ping_url(), "ping"), SendOptions::default())
        .unwrap();
    settle().await;
    assert!(future.poll().unwrap().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
