//! Integration tests for the hub's client and agent WebSocket surfaces.
//!
//! Each test spins up a real (non-TLS) hub on an ephemeral port, talks to
//! it with a plain WebSocket client, and asserts on the frames that come
//! back. Launcher-backed tests run a real session launcher in-process
//! against a throwaway registry.

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use claude_relay::config::{Config, PtyGeometry};
use claude_relay::launcher::{run_launcher, LauncherOptions};
use claude_relay::protocol::SessionState;
use claude_relay::registry::{pipe_path, SessionRecord, SessionRegistry};
use claude_relay::server::{build_router, HubState};
use claude_relay::util::now_ms;

const CLIENT_TOKEN: &str = "test-client-token";
const AGENT_TOKEN: &str = "test-agent-token";

/// One pipe directory for the whole test binary; launchers are
/// distinguished by session id.
fn pipe_dir() -> &'static std::path::Path {
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    let dir = DIR.get_or_init(|| tempfile::tempdir().unwrap());
    std::env::set_var("CLAUDE_RELAY_PIPE_DIR", dir.path());
    dir.path()
}

struct TestHub {
    addr: SocketAddr,
    registry: SessionRegistry,
    _registry_dir: tempfile::TempDir,
    _projects_dir: tempfile::TempDir,
}

impl TestHub {
    fn client_url(&self) -> String {
        format!("ws://{}/?token={}", self.addr, CLIENT_TOKEN)
    }

    fn agent_url(&self) -> String {
        format!("ws://{}/agent?token={}", self.addr, AGENT_TOKEN)
    }
}

/// Spin up a hub over plain TCP with throwaway registry/projects dirs.
async fn start_test_hub() -> TestHub {
    pipe_dir();
    let registry_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();

    let config = Config {
        auth_token: Some(CLIENT_TOKEN.to_string()),
        agent_token: Some(AGENT_TOKEN.to_string()),
        projects_dir: Some(projects_dir.path().to_path_buf()),
        ..Default::default()
    };
    let mut state = HubState::new(config).unwrap();
    state.registry = SessionRegistry::new(registry_dir.path().to_path_buf());
    let registry = state.registry.clone();

    let app = build_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestHub {
        addr,
        registry,
        _registry_dir: registry_dir,
        _projects_dir: projects_dir,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str) -> WsClient {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("frame readable");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthenticated_client_gets_error_and_close_4001() {
    let hub = start_test_hub().await;
    let url = format!("ws://{}/", hub.addr);
    let mut ws = connect(&url).await;

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "error");

    let close = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match close {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4001),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_endpoint_rejects_bad_token_with_401() {
    let hub = start_test_hub().await;
    let url = format!("ws://{}/agent?token=wrong", hub.addr);
    let err = tokio_tungstenite::connect_async(&url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Basic protocol
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_sends_initial_sessions_then_ping_pong() {
    let hub = start_test_hub().await;
    let mut ws = connect(&hub.client_url()).await;

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "sessions");
    assert!(first["sessions"].is_array());

    send_json(&mut ws, json!({"type": "ping"})).await;
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_request_types_are_ignored() {
    let hub = start_test_hub().await;
    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await; // initial sessions

    send_json(&mut ws, json!({"type": "mystery_method"})).await;
    send_json(&mut ws, json!({"type": "ping"})).await;
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
}

// ---------------------------------------------------------------------------
// Stale session reaping
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_sessions_excluded_and_unlinked_on_list() {
    let hub = start_test_hub().await;

    hub.registry
        .publish(&SessionRecord {
            id: "old".to_string(),
            cwd: "/tmp".into(),
            pid: 1,
            pipe: pipe_path("old"),
            started: now_ms() - 45_000,
            last_seen: now_ms() - 45_000,
            client_count: 0,
            preview: String::new(),
            status: SessionState::Idle,
        })
        .unwrap();

    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "list_sessions"})).await;
    let sessions = next_json(&mut ws).await;
    assert_eq!(sessions["type"], "sessions");
    let listed = sessions["sessions"].as_array().unwrap();
    assert!(listed.iter().all(|s| s["id"] != "old"));
    assert!(!hub.registry.dir().join("old.json").exists());
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_yields_errors_but_keeps_connection() {
    let hub = start_test_hub().await;
    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    for _ in 0..12 {
        send_json(&mut ws, json!({"type": "list_sessions"})).await;
    }

    let mut sessions = 0;
    let mut errors = 0;
    for _ in 0..12 {
        let frame = next_json(&mut ws).await;
        match frame["type"].as_str().unwrap() {
            "sessions" => sessions += 1,
            "error" => {
                assert_eq!(frame["message"], "Rate limit exceeded");
                errors += 1;
            }
            other => panic!("unexpected frame type {}", other),
        }
    }
    assert_eq!(sessions, 10);
    assert!((1..=2).contains(&errors));

    // The connection survives; the next window serves again.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    send_json(&mut ws, json!({"type": "ping"})).await;
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
}

// ---------------------------------------------------------------------------
// Attach, echo, duplicate attach
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attach_receives_scrollback_then_status_and_duplicate_attach_skips_scrollback() {
    let hub = start_test_hub().await;

    let opts = LauncherOptions {
        id: "proj".to_string(),
        cwd: std::env::temp_dir(),
        argv: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo hello; exec cat".to_string(),
        ],
        geometry: PtyGeometry::default(),
        skip_permissions: false,
    };
    let launcher_registry = hub.registry.clone();
    tokio::spawn(run_launcher(opts, launcher_registry));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(hub.registry.get("proj").is_some(), "launcher published");

    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "connect_session", "sessionId": "proj"})).await;

    let scrollback = next_json(&mut ws).await;
    assert_eq!(scrollback["type"], "scrollback");
    assert_eq!(scrollback["sessionId"], "proj");
    assert!(scrollback["data"].as_str().unwrap().contains("hello"));

    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["sessionId"], "proj");
    assert_eq!(status["state"], "connected");

    // Input reaches the PTY; cat echoes it back as output.
    send_json(&mut ws, json!({"type": "input", "data": "marker\n"})).await;
    let mut echoed = String::new();
    loop {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "output");
        assert_eq!(frame["sessionId"], "proj");
        echoed.push_str(frame["data"].as_str().unwrap());
        if echoed.contains("marker") {
            break;
        }
    }

    // Duplicate attach: status only, no second scrollback. Stray PTY
    // echo output may still be in flight, so skip output frames.
    send_json(&mut ws, json!({"type": "connect_session", "sessionId": "proj"})).await;
    loop {
        let frame = next_json(&mut ws).await;
        match frame["type"].as_str().unwrap() {
            "output" => continue,
            "status" => {
                assert_eq!(frame["state"], "connected");
                break;
            }
            "scrollback" => panic!("duplicate attach must not replay scrollback"),
            other => panic!("unexpected frame type {}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attach_to_unknown_session_reports_error_then_disconnected() {
    let hub = start_test_hub().await;
    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "connect_session", "sessionId": "ghost"}),
    )
    .await;

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Session not found");
    assert_eq!(error["sessionId"], "ghost");

    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["state"], "disconnected");
    assert_eq!(status["reason"], "Session not found");
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_path_escape_fails_closed() {
    let hub = start_test_hub().await;

    let cwd = tempfile::tempdir().unwrap();
    hub.registry
        .publish(&SessionRecord {
            id: "proj".to_string(),
            cwd: cwd.path().to_path_buf(),
            pid: std::process::id(),
            pipe: pipe_path("proj"),
            started: now_ms(),
            last_seen: now_ms(),
            client_count: 0,
            preview: String::new(),
            status: SessionState::Idle,
        })
        .unwrap();

    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({
            "type": "upload_file",
            "sessionId": "proj",
            "filename": "../../etc/passwd",
            "data": "YWJj",
            "size": 3,
        }),
    )
    .await;

    let result = next_json(&mut ws).await;
    assert_eq!(result["type"], "upload_result");
    assert_eq!(result["success"], false);
    assert_eq!(result["filename"], "etc_passwd");
    assert!(result["error"].as_str().unwrap().len() > 1);
    assert!(std::fs::read_dir(cwd.path()).unwrap().next().is_none());

    // A clean upload to the same session succeeds.
    send_json(
        &mut ws,
        json!({
            "type": "upload_file",
            "sessionId": "proj",
            "filename": "notes.txt",
            "data": "YWJj",
            "size": 3,
        }),
    )
    .await;
    let result = next_json(&mut ws).await;
    assert_eq!(result["success"], true);
    assert_eq!(
        std::fs::read(cwd.path().join("notes.txt")).unwrap(),
        b"abc"
    );
}

// ---------------------------------------------------------------------------
// Agent federation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_agent_appears_in_machine_list() {
    let hub = start_test_hub().await;

    let mut agent_ws = connect(&hub.agent_url()).await;
    send_json(
        &mut agent_ws,
        json!({
            "type": "agent:register",
            "machineId": "A",
            "hostname": "peer-box",
            "address": "wss://peer-box:9443",
            "agentVersion": "0.4.2",
        }),
    )
    .await;
    let registered = next_json(&mut agent_ws).await;
    assert_eq!(registered["type"], "hub:registered");
    assert_eq!(registered["success"], true);

    send_json(
        &mut agent_ws,
        json!({
            "type": "agent:sessions",
            "machineId": "A",
            "sessions": [{"id": "sA"}],
        }),
    )
    .await;

    send_json(&mut agent_ws, json!({"type": "agent:heartbeat", "machineId": "A"})).await;
    let pong = next_json(&mut agent_ws).await;
    assert_eq!(pong["type"], "hub:pong");

    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;
    send_json(&mut ws, json!({"type": "list_machines"})).await;
    let machines = next_json(&mut ws).await;
    assert_eq!(machines["type"], "machines");
    let list = machines["machines"].as_array().unwrap();

    let local = list.iter().find(|m| m["id"] == "LOCAL").unwrap();
    assert_eq!(local["isLocal"], true);
    assert_eq!(local["status"], "connected");

    let peer = list.iter().find(|m| m["id"] == "A").unwrap();
    assert_eq!(peer["status"], "connected");
    assert_eq!(peer["sessionCount"], 1);
    assert_eq!(peer["address"], "wss://peer-box:9443");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_agent_registration_closes_older_socket_with_4000() {
    let hub = start_test_hub().await;

    let mut first = connect(&hub.agent_url()).await;
    send_json(
        &mut first,
        json!({
            "type": "agent:register",
            "machineId": "A",
            "hostname": "peer-box",
            "address": "wss://peer-box:9443",
            "agentVersion": "0.4.2",
        }),
    )
    .await;
    next_json(&mut first).await;

    let mut second = connect(&hub.agent_url()).await;
    send_json(
        &mut second,
        json!({
            "type": "agent:register",
            "machineId": "A",
            "hostname": "peer-box",
            "address": "wss://peer-box:9443",
            "agentVersion": "0.4.2",
        }),
    )
    .await;
    next_json(&mut second).await;

    // The first connection is force-closed with the replaced code.
    let closed = timeout(Duration::from_secs(5), async move {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .unwrap();
    let frame = closed.expect("close frame with code");
    assert_eq!(u16::from(frame.code), 4000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reserved_machine_id_rejected() {
    let hub = start_test_hub().await;
    let mut agent_ws = connect(&hub.agent_url()).await;
    send_json(
        &mut agent_ws,
        json!({
            "type": "agent:register",
            "machineId": "LOCAL",
            "hostname": "sneaky",
            "address": "wss://sneaky:9443",
            "agentVersion": "0.4.2",
        }),
    )
    .await;
    let registered = next_json(&mut agent_ws).await;
    assert_eq!(registered["type"], "hub:registered");
    assert_eq!(registered["success"], false);
    assert!(registered["error"].as_str().unwrap().contains("reserved"));
}

// ---------------------------------------------------------------------------
// Folder sessions
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_folder_session_requires_existing_folder() {
    let hub = start_test_hub().await;
    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "start_folder_session", "folderName": "missing"}),
    )
    .await;
    let result = next_json(&mut ws).await;
    assert_eq!(result["type"], "start_folder_session_result");
    assert_eq!(result["success"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_folder_session_reports_already_running() {
    let hub = start_test_hub().await;
    std::fs::create_dir(hub._projects_dir.path().join("web")).unwrap();

    hub.registry
        .publish(&SessionRecord {
            id: "web".to_string(),
            cwd: hub._projects_dir.path().join("web"),
            pid: std::process::id(),
            pipe: pipe_path("web"),
            started: now_ms(),
            last_seen: now_ms(),
            client_count: 0,
            preview: String::new(),
            status: SessionState::Idle,
        })
        .unwrap();

    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "start_folder_session", "folderName": "web"}),
    )
    .await;
    let result = next_json(&mut ws).await;
    assert_eq!(result["type"], "start_folder_session_result");
    assert_eq!(result["success"], true);
    assert_eq!(result["alreadyRunning"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_session_rejects_invalid_names() {
    let hub = start_test_hub().await;
    let mut ws = connect(&hub.client_url()).await;
    next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "create_session", "projectName": "../escape"}),
    )
    .await;
    let result = next_json(&mut ws).await;
    assert_eq!(result["type"], "create_session_result");
    assert_eq!(result["success"], false);
}
