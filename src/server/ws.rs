//! Client WebSocket handler.
//!
//! One task per client socket plus one task per attached pipe. The client
//! holds a map of `sessionId → PipeConn`; exactly one session is active
//! and receives `input`/`control`/`resize` forwarding. Every
//! `output`/`scrollback`/`status` frame leaving the hub carries a
//! `sessionId` stamp.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::projects;
use crate::protocol::{ClientEvent, ClientRequest, LscFrame, SessionState, CLOSE_AUTH_FAILURE};
use crate::server::ratelimit::MessageRateLimiter;
use crate::server::{spawn, upload, HubState};

/// Hub → client liveness ping cadence.
pub const WS_PING_INTERVAL_SECS: u64 = 30;
/// Missed pongs before the connection is terminated.
pub const WS_MAX_MISSED_PONGS: u32 = 2;
/// Dial timeout for the local session channel.
pub const LSC_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Keepalive ping cadence on an attached pipe.
pub const LSC_KEEPALIVE_SECS: u64 = 15;
/// Accumulation cap per attached pipe; overflow destroys the pipe.
pub const PIPE_BUFFER_CAP: usize = 1024 * 1024;

/// One attached local session channel.
struct PipeConn {
    writer_tx: mpsc::UnboundedSender<String>,
    connected: bool,
    task: tokio::task::JoinHandle<()>,
}

/// Per-client state shared with the pipe tasks.
#[derive(Default)]
struct ClientShared {
    pipes: HashMap<String, PipeConn>,
    active_session: Option<String>,
}

/// Upgrade an authenticated client connection.
pub fn handle_upgrade(ws: WebSocketUpgrade, state: Arc<HubState>, authorized: bool) -> Response {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, authorized))
}

async fn handle_client_socket(socket: WebSocket, state: Arc<HubState>, authorized: bool) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    if !authorized {
        send_event(
            &tx,
            &ClientEvent::Error {
                message: "Authentication required".to_string(),
                session_id: None,
            },
        );
        let _ = tx.send(Message::Close(Some(CloseFrame {
            code: CLOSE_AUTH_FAILURE,
            reason: "authentication failed".into(),
        })));
        drop(tx);
        let _ = send_task.await;
        return;
    }

    debug!("client connected");
    let shared = Arc::new(Mutex::new(ClientShared::default()));

    send_event(
        &tx,
        &ClientEvent::Sessions {
            sessions: sessions_snapshot(&state),
        },
    );

    let missed_pongs = Arc::new(AtomicU32::new(0));
    let ping_task = spawn_ping_task(tx.clone(), missed_pongs.clone());

    let mut limiter = MessageRateLimiter::default();
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                if !limiter.allow() {
                    send_event(
                        &tx,
                        &ClientEvent::Error {
                            message: "Rate limit exceeded".to_string(),
                            session_id: None,
                        },
                    );
                    continue;
                }
                let request = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => request,
                    Err(err) => {
                        debug!(error = %err, "ignoring unrecognized client frame");
                        continue;
                    }
                };
                dispatch_request(request, &state, &shared, &tx).await;
            }
            Message::Pong(_) => {
                missed_pongs.store(0, Ordering::Relaxed);
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Binary(_) => {}
        }
    }

    ping_task.abort();
    {
        let mut shared = shared.lock();
        for (_, pipe) in shared.pipes.drain() {
            pipe.task.abort();
        }
    }
    drop(tx);
    let _ = send_task.await;
    debug!("client disconnected");
}

/// Ping the client on a fixed cadence; two unanswered pings terminate.
fn spawn_ping_task(
    tx: mpsc::UnboundedSender<Message>,
    missed: Arc<AtomicU32>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if missed.fetch_add(1, Ordering::Relaxed) >= WS_MAX_MISSED_PONGS {
                warn!("client missed liveness pings, terminating");
                let _ = tx.send(Message::Close(None));
                break;
            }
            if tx.send(Message::Ping(Vec::new())).is_err() {
                break;
            }
        }
    })
}

fn send_event(tx: &mpsc::UnboundedSender<Message>, event: &ClientEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = tx.send(Message::Text(text));
    }
}

fn send_raw(tx: &mpsc::UnboundedSender<Message>, value: &Value) {
    if let Ok(text) = serde_json::to_string(value) {
        let _ = tx.send(Message::Text(text));
    }
}

fn sessions_snapshot(state: &HubState) -> Vec<Value> {
    state
        .registry
        .scan()
        .iter()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect()
}

fn projects_snapshot(state: &HubState) -> Vec<Value> {
    projects::list_projects(&state.config.projects_dir(), &state.registry)
        .iter()
        .filter_map(|p| serde_json::to_value(p).ok())
        .collect()
}

fn folders_snapshot(state: &HubState) -> Vec<Value> {
    projects::list_folders(&state.config.projects_dir())
        .iter()
        .filter_map(|f| serde_json::to_value(f).ok())
        .collect()
}

async fn dispatch_request(
    request: ClientRequest,
    state: &Arc<HubState>,
    shared: &Arc<Mutex<ClientShared>>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match request {
        ClientRequest::Ping => send_event(tx, &ClientEvent::Pong),
        ClientRequest::ListSessions => send_event(
            tx,
            &ClientEvent::Sessions {
                sessions: sessions_snapshot(state),
            },
        ),
        ClientRequest::ListProjects => send_event(
            tx,
            &ClientEvent::Projects {
                projects: projects_snapshot(state),
            },
        ),
        ClientRequest::ListFolders => send_event(
            tx,
            &ClientEvent::Folders {
                folders: folders_snapshot(state),
            },
        ),
        ClientRequest::ListMachines => {
            state
                .machines
                .refresh_local(projects_snapshot(state), sessions_snapshot(state));
            let machines = state
                .machines
                .list()
                .iter()
                .filter_map(|m| serde_json::to_value(m).ok())
                .collect();
            send_event(tx, &ClientEvent::Machines { machines });
        }
        ClientRequest::ConnectSession { session_id } => {
            connect_session(state, shared, tx, session_id);
        }
        ClientRequest::Input { data } => {
            forward_to_active(shared, LscFrame::Input { data });
        }
        ClientRequest::Control { key } => {
            forward_to_active(shared, LscFrame::Control { key });
        }
        ClientRequest::Resize { cols, rows } => {
            forward_to_active(shared, LscFrame::Resize { cols, rows });
        }
        ClientRequest::UploadFile {
            session_id,
            filename,
            data,
            size,
        } => {
            handle_upload_request(state, tx, session_id, filename, data, size);
        }
        ClientRequest::CreateSession { project_name } => {
            handle_create_session(state, tx, project_name);
        }
        ClientRequest::StartFolderSession {
            folder_name,
            skip_permissions,
        } => {
            handle_start_folder_session(state, tx, folder_name, skip_permissions);
        }
    }
}

/// Forward a frame to the client's active session, if any. An unknown or
/// not-yet-connected active session drops the frame silently.
fn forward_to_active(shared: &Arc<Mutex<ClientShared>>, frame: LscFrame) {
    let shared = shared.lock();
    let Some(active) = shared.active_session.as_deref() else {
        return;
    };
    if let Some(pipe) = shared.pipes.get(active) {
        if pipe.connected {
            let _ = pipe.writer_tx.send(frame.to_line());
        }
    }
}

/// The attach algorithm.
fn connect_session(
    state: &Arc<HubState>,
    shared: &Arc<Mutex<ClientShared>>,
    tx: &mpsc::UnboundedSender<Message>,
    session_id: String,
) {
    {
        let mut guard = shared.lock();
        if let Some(pipe) = guard.pipes.get(&session_id) {
            if pipe.connected {
                guard.active_session = Some(session_id.clone());
                send_event(
                    tx,
                    &ClientEvent::Status {
                        session_id,
                        state: SessionState::Connected,
                        reason: None,
                    },
                );
            } else {
                // Dial already in progress; keep the single pipe.
                guard.active_session = Some(session_id);
            }
            return;
        }
    }

    let Some(record) = state.registry.get(&session_id) else {
        send_event(
            tx,
            &ClientEvent::Error {
                message: "Session not found".to_string(),
                session_id: Some(session_id.clone()),
            },
        );
        send_event(
            tx,
            &ClientEvent::Status {
                session_id,
                state: SessionState::Disconnected,
                reason: Some("Session not found".to_string()),
            },
        );
        return;
    };

    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
    // Insert under the lock the pipe task will contend on, so the task
    // always finds its own entry once the dial completes.
    let mut guard = shared.lock();
    let task = tokio::spawn(run_pipe(
        state.clone(),
        shared.clone(),
        tx.clone(),
        session_id.clone(),
        record.pipe.clone(),
        writer_rx,
    ));
    guard.pipes.insert(
        session_id.clone(),
        PipeConn {
            writer_tx,
            connected: false,
            task,
        },
    );
    guard.active_session = Some(session_id);
}

/// Remove a pipe and tell the client it is gone.
fn teardown_pipe(
    shared: &Arc<Mutex<ClientShared>>,
    tx: &mpsc::UnboundedSender<Message>,
    session_id: &str,
    error: Option<&str>,
    reason: &str,
) {
    {
        let mut guard = shared.lock();
        guard.pipes.remove(session_id);
    }
    if let Some(message) = error {
        send_event(
            tx,
            &ClientEvent::Error {
                message: message.to_string(),
                session_id: Some(session_id.to_string()),
            },
        );
    }
    send_event(
        tx,
        &ClientEvent::Status {
            session_id: session_id.to_string(),
            state: SessionState::Disconnected,
            reason: Some(reason.to_string()),
        },
    );
}

/// One attached pipe: dial, greet with a resize, keep alive, and forward
/// every frame to the client stamped with the session id.
async fn run_pipe(
    state: Arc<HubState>,
    shared: Arc<Mutex<ClientShared>>,
    tx: mpsc::UnboundedSender<Message>,
    session_id: String,
    pipe_path: std::path::PathBuf,
    mut writer_rx: mpsc::UnboundedReceiver<String>,
) {
    let dialed = timeout(
        Duration::from_secs(LSC_CONNECT_TIMEOUT_SECS),
        UnixStream::connect(&pipe_path),
    )
    .await;

    let stream = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(session_id = %session_id, error = %err, "pipe dial failed");
            teardown_pipe(
                &shared,
                &tx,
                &session_id,
                Some("Failed to connect to session"),
                "Connection failed",
            );
            return;
        }
        Err(_) => {
            debug!(session_id = %session_id, "pipe dial timed out");
            teardown_pipe(
                &shared,
                &tx,
                &session_id,
                Some("Connection to session timed out"),
                "Connection timeout",
            );
            return;
        }
    };

    // The client may have vanished while dialing.
    {
        let mut guard = shared.lock();
        match guard.pipes.get_mut(&session_id) {
            Some(pipe) => pipe.connected = true,
            None => return,
        }
    }
    info!(session_id = %session_id, "pipe attached");

    let geometry = state.config.pty_geometry();
    let (read_half, mut write_half) = stream.into_split();

    let writer_session = session_id.clone();
    let writer_task = tokio::spawn(async move {
        let initial = LscFrame::Resize {
            cols: geometry.cols,
            rows: geometry.rows,
        }
        .to_line();
        if write_half.write_all(initial.as_bytes()).await.is_err() {
            return;
        }
        let mut keepalive = tokio::time::interval(Duration::from_secs(LSC_KEEPALIVE_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;
        loop {
            tokio::select! {
                line = writer_rx.recv() => {
                    match line {
                        Some(line) => {
                            if write_half.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    if write_half.write_all(LscFrame::Ping.to_line().as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(session_id = %writer_session, "pipe writer ended");
    });

    let reason = pipe_read_loop(read_half, &session_id, &tx).await;
    writer_task.abort();

    // Only tear down if this pipe is still the registered one.
    let still_ours = {
        let guard = shared.lock();
        guard.pipes.contains_key(&session_id)
    };
    if still_ours {
        match reason {
            PipeEnd::Overflow => teardown_pipe(
                &shared,
                &tx,
                &session_id,
                Some("Buffer overflow"),
                "Buffer overflow",
            ),
            PipeEnd::Closed => {
                teardown_pipe(&shared, &tx, &session_id, None, "Connection closed")
            }
        }
    }
}

enum PipeEnd {
    Closed,
    Overflow,
}

/// Read newline-delimited frames from the pipe and forward them to the
/// client. Returns why the loop ended.
async fn pipe_read_loop(
    mut read_half: tokio::net::unix::OwnedReadHalf,
    session_id: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> PipeEnd {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => return PipeEnd::Closed,
            Ok(n) => n,
        };
        if buffer.len() + n > PIPE_BUFFER_CAP {
            warn!(session_id = %session_id, "pipe buffer overflow");
            return PipeEnd::Overflow;
        }
        buffer.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            forward_pipe_line(line, session_id, tx);
        }
    }
}

/// Stamp a frame from the pipe with the session id and pass it on.
/// `pong` frames are swallowed (keepalive replies); non-JSON lines are
/// wrapped as output.
fn forward_pipe_line(line: &[u8], session_id: &str, tx: &mpsc::UnboundedSender<Message>) {
    match serde_json::from_slice::<Value>(line) {
        Ok(mut value) => {
            if value.get("type").and_then(|t| t.as_str()) == Some("pong") {
                return;
            }
            if let Some(obj) = value.as_object_mut() {
                obj.insert("sessionId".to_string(), json!(session_id));
            }
            send_raw(tx, &value);
        }
        Err(_) => {
            let data = format!("{}\n", String::from_utf8_lossy(line));
            send_event(
                tx,
                &ClientEvent::Output {
                    session_id: session_id.to_string(),
                    data,
                },
            );
        }
    }
}

fn handle_upload_request(
    state: &Arc<HubState>,
    tx: &mpsc::UnboundedSender<Message>,
    session_id: String,
    filename: String,
    data: String,
    size: u64,
) {
    let Some(record) = state.registry.get(&session_id) else {
        send_event(
            tx,
            &ClientEvent::UploadResult {
                success: false,
                filename: None,
                error: Some("Session not found".to_string()),
            },
        );
        return;
    };

    let stored = upload::handle_upload(
        state.config.upload_enabled(),
        state.config.max_upload_bytes(),
        &record.cwd,
        &filename,
        &data,
        size,
    );
    match stored {
        Ok(filename) => {
            info!(session_id = %session_id, filename = %filename, "upload stored");
            send_event(
                tx,
                &ClientEvent::UploadResult {
                    success: true,
                    filename: Some(filename),
                    error: None,
                },
            );
        }
        Err(err) => send_event(
            tx,
            &ClientEvent::UploadResult {
                success: false,
                filename: upload::sanitize_filename(&filename).ok(),
                error: Some(err.to_string()),
            },
        ),
    }
}

fn handle_create_session(
    state: &Arc<HubState>,
    tx: &mpsc::UnboundedSender<Message>,
    project_name: String,
) {
    let Some(name) = projects::sanitize_project_name(&project_name) else {
        send_event(
            tx,
            &ClientEvent::CreateSessionResult {
                success: false,
                project_name: None,
                error: Some("Invalid project name".to_string()),
            },
        );
        return;
    };

    let dir = state.config.projects_dir().join(name);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        send_event(
            tx,
            &ClientEvent::CreateSessionResult {
                success: false,
                project_name: Some(name.to_string()),
                error: Some(format!("Failed to create project directory: {}", err)),
            },
        );
        return;
    }

    match spawn::spawn_detached_launcher(name, &dir, false, &state.launcher_pids) {
        Ok(_) => send_event(
            tx,
            &ClientEvent::CreateSessionResult {
                success: true,
                project_name: Some(name.to_string()),
                error: None,
            },
        ),
        Err(err) => send_event(
            tx,
            &ClientEvent::CreateSessionResult {
                success: false,
                project_name: Some(name.to_string()),
                error: Some(format!("Failed to start launcher: {}", err)),
            },
        ),
    }
}

fn handle_start_folder_session(
    state: &Arc<HubState>,
    tx: &mpsc::UnboundedSender<Message>,
    folder_name: String,
    skip_permissions: bool,
) {
    let Some(name) = projects::sanitize_project_name(&folder_name) else {
        send_event(
            tx,
            &ClientEvent::StartFolderSessionResult {
                success: false,
                folder_name: None,
                already_running: false,
                error: Some("Invalid folder name".to_string()),
            },
        );
        return;
    };

    let dir = state.config.projects_dir().join(name);
    if !dir.is_dir() {
        send_event(
            tx,
            &ClientEvent::StartFolderSessionResult {
                success: false,
                folder_name: Some(name.to_string()),
                already_running: false,
                error: Some("Folder does not exist".to_string()),
            },
        );
        return;
    }

    if state.registry.is_live(name) {
        send_event(
            tx,
            &ClientEvent::StartFolderSessionResult {
                success: true,
                folder_name: Some(name.to_string()),
                already_running: true,
                error: None,
            },
        );
        return;
    }

    match spawn::spawn_detached_launcher(name, &dir, skip_permissions, &state.launcher_pids) {
        Ok(_) => send_event(
            tx,
            &ClientEvent::StartFolderSessionResult {
                success: true,
                folder_name: Some(name.to_string()),
                already_running: false,
                error: None,
            },
        ),
        Err(err) => send_event(
            tx,
            &ClientEvent::StartFolderSessionResult {
                success: false,
                folder_name: Some(name.to_string()),
                already_running: false,
                error: Some(format!("Failed to start launcher: {}", err)),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_pipe_line_stamps_session_id() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        forward_pipe_line(br#"{"type":"output","data":"hi"}"#, "proj", &tx);
        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["sessionId"], "proj");
        assert_eq!(value["type"], "output");
    }

    #[test]
    fn forward_pipe_line_swallows_pong() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        forward_pipe_line(br#"{"type":"pong"}"#, "proj", &tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pipe_buffer_accepts_exactly_one_mebibyte() {
        let (client, server) = UnixStream::pair().unwrap();
        let (read_half, _keep_write) = server.into_split();
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();

        let reader = tokio::spawn(async move { pipe_read_loop(read_half, "proj", &tx).await });

        // Exactly the cap, no newline: accumulates without overflow.
        let mut client = client;
        client
            .write_all(&vec![b'x'; PIPE_BUFFER_CAP])
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        match reader.await.unwrap() {
            PipeEnd::Closed => {}
            PipeEnd::Overflow => panic!("exact cap must not overflow"),
        }
    }

    #[tokio::test]
    async fn pipe_buffer_overflow_one_byte_past_cap() {
        let (client, server) = UnixStream::pair().unwrap();
        let (read_half, _keep_write) = server.into_split();
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();

        let reader = tokio::spawn(async move { pipe_read_loop(read_half, "proj", &tx).await });

        let mut client = client;
        client
            .write_all(&vec![b'x'; PIPE_BUFFER_CAP + 1])
            .await
            .unwrap();

        match reader.await.unwrap() {
            PipeEnd::Overflow => {}
            PipeEnd::Closed => panic!("one byte past the cap must overflow"),
        }
    }

    #[test]
    fn forward_pipe_line_wraps_non_json_as_output() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        forward_pipe_line(b"plain text", "proj", &tx);
        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["sessionId"], "proj");
        assert_eq!(value["data"], "plain text\n");
    }
}
