//! Session launcher
//!
//! Owns one PTY child, exposes its byte stream and control channel to
//! multiple local subscribers over the local session channel (a Unix
//! socket carrying newline-delimited JSON frames), and advertises itself
//! through the session registry with a heartbeat record.
//!
//! Ownership: the launcher owns the scrollback ring exclusively. Peers
//! receive copies of each output chunk through their own unbounded
//! channel; a peer whose socket stalls is dropped, never the child.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::PtyGeometry;
use crate::protocol::{LscFrame, SessionState};
use crate::registry::{pipe_path, SessionRecord, SessionRegistry};
use crate::term::ScrollbackRing;
use crate::util::now_ms;

/// Heartbeat cadence for the registry record.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;
/// Per-peer inbound parse buffer cap. Overflow resets the buffer and logs
/// a warning without closing the connection.
pub const PEER_BUFFER_CAP: usize = 64 * 1024;
/// A session with output newer than this counts as running rather than idle.
const RUNNING_WINDOW_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("session id {0:?} already has a live launcher")]
    IdInUse(String),
    #[error("failed to bind local endpoint {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn PTY child: {0}")]
    Spawn(String),
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
}

/// Options for starting a launcher.
#[derive(Debug, Clone)]
pub struct LauncherOptions {
    pub id: String,
    pub cwd: PathBuf,
    /// Child argv; defaults to the agent CLI when empty.
    pub argv: Vec<String>,
    pub geometry: PtyGeometry,
    /// Opaque child flag, forwarded untouched.
    pub skip_permissions: bool,
}

impl LauncherOptions {
    fn child_argv(&self) -> Vec<String> {
        let mut argv = if self.argv.is_empty() {
            let cmd = std::env::var("CLAUDE_RELAY_AGENT_CMD")
                .unwrap_or_else(|_| "claude".to_string());
            vec![cmd]
        } else {
            self.argv.clone()
        };
        if self.skip_permissions {
            argv.push("--dangerously-skip-permissions".to_string());
        }
        argv
    }
}

type PeerSender = mpsc::UnboundedSender<String>;

/// Shared launcher state: the ring and the live peer set.
struct Shared {
    ring: ScrollbackRing,
    peers: HashMap<u64, PeerSender>,
    next_peer_id: u64,
    last_output_ms: u64,
}

impl Shared {
    fn status(&self) -> SessionState {
        if !self.peers.is_empty() {
            SessionState::Connected
        } else if now_ms().saturating_sub(self.last_output_ms) < RUNNING_WINDOW_MS {
            SessionState::Running
        } else {
            SessionState::Idle
        }
    }

    fn broadcast(&mut self, frame: &LscFrame) {
        let line = frame.to_line();
        self.peers.retain(|peer_id, tx| {
            if tx.send(line.clone()).is_err() {
                debug!(peer_id, "dropping dead peer");
                false
            } else {
                true
            }
        });
    }
}

/// Run a session launcher until its child exits or a shutdown signal
/// arrives. Returns the child's exit code.
pub async fn run_launcher(
    opts: LauncherOptions,
    registry: SessionRegistry,
) -> Result<i32, LauncherError> {
    let pipe = pipe_path(&opts.id);

    if registry.is_live(&opts.id) {
        return Err(LauncherError::IdInUse(opts.id.clone()));
    }
    // A leftover socket from a dead launcher is safe to unlink once the
    // registry says the id is free.
    let _ = std::fs::remove_file(&pipe);

    let listener = UnixListener::bind(&pipe).map_err(|source| LauncherError::Bind {
        path: pipe.clone(),
        source,
    })?;

    let pty = spawn_pty(&opts)?;
    info!(
        session_id = %opts.id,
        cwd = %opts.cwd.display(),
        pipe = %pipe.display(),
        "session launcher started"
    );

    let shared = Arc::new(Mutex::new(Shared {
        ring: ScrollbackRing::new(),
        peers: HashMap::new(),
        next_peer_id: 0,
        last_output_ms: now_ms(),
    }));

    let started = now_ms();
    publish_record(&registry, &opts, &pipe, started, &shared)?;

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    spawn_reader_pump(pty.reader, output_tx);

    let (exit_tx, mut exit_rx) = mpsc::channel::<i32>(1);
    spawn_wait_thread(pty.child, exit_tx);

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(
        HEARTBEAT_INTERVAL_SECS,
    ));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut killer = pty.killer;
    let input_tx = pty.input_tx;
    let master = pty.master;
    let mut output_open = true;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let exit_code = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        spawn_peer(stream, shared.clone(), input_tx.clone(), master.clone());
                    }
                    Err(err) => warn!(error = %err, "local endpoint accept failed"),
                }
            }
            chunk = output_rx.recv(), if output_open => {
                match chunk {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let mut shared = shared.lock();
                        shared.ring.push_chunk(&text);
                        shared.last_output_ms = now_ms();
                        shared.broadcast(&LscFrame::Output { data: text });
                    }
                    // Reader EOF; the wait thread will report the exit code.
                    None => output_open = false,
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = publish_record(&registry, &opts, &pipe, started, &shared) {
                    warn!(error = %err, "heartbeat publish failed");
                }
            }
            code = exit_rx.recv() => {
                break code.unwrap_or(-1);
            }
            _ = &mut shutdown => {
                info!(session_id = %opts.id, "shutdown signal, terminating child");
                let _ = killer.kill();
                break exit_rx.recv().await.unwrap_or(-1);
            }
        }
    };

    {
        let mut shared = shared.lock();
        // Flush output that raced the exit notification.
        while let Ok(bytes) = output_rx.try_recv() {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            shared.ring.push_chunk(&text);
            shared.broadcast(&LscFrame::Output { data: text });
        }
        shared.broadcast(&LscFrame::Status {
            state: SessionState::Disconnected,
            reason: Some(format!("Process exited ({})", exit_code)),
        });
        shared.peers.clear();
    }

    registry.remove(&opts.id);
    let _ = std::fs::remove_file(&pipe);
    info!(session_id = %opts.id, exit_code, "session launcher exiting");
    Ok(exit_code)
}

struct PtyHandles {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    reader: Box<dyn Read + Send>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

fn spawn_pty(opts: &LauncherOptions) -> Result<PtyHandles, LauncherError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: opts.geometry.rows,
            cols: opts.geometry.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| LauncherError::Spawn(e.to_string()))?;

    let argv = opts.child_argv();
    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.cwd(&opts.cwd);

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| LauncherError::Spawn(e.to_string()))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| LauncherError::Spawn(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| LauncherError::Spawn(e.to_string()))?;

    let input_tx = spawn_writer_thread(writer);

    Ok(PtyHandles {
        master: Arc::new(Mutex::new(pair.master)),
        reader,
        input_tx,
        killer,
        child,
    })
}

/// Blocking PTY read pump on its own thread; chunks flow into the async
/// loop through an unbounded channel.
fn spawn_reader_pump(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Dedicated writer thread owning the PTY input handle.
fn spawn_writer_thread(mut writer: Box<dyn Write + Send>) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        while let Some(bytes) = rx.blocking_recv() {
            if writer.write_all(&bytes).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });
    tx
}

/// Waits for child exit on a blocking thread.
fn spawn_wait_thread(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    tx: mpsc::Sender<i32>,
) {
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        let _ = tx.blocking_send(code);
    });
}

fn publish_record(
    registry: &SessionRegistry,
    opts: &LauncherOptions,
    pipe: &PathBuf,
    started: u64,
    shared: &Arc<Mutex<Shared>>,
) -> Result<(), crate::registry::RegistryError> {
    let (client_count, preview, status) = {
        let shared = shared.lock();
        (
            shared.peers.len() as u32,
            shared.ring.preview(),
            shared.status(),
        )
    };
    registry.publish(&SessionRecord {
        id: opts.id.clone(),
        cwd: opts.cwd.clone(),
        pid: std::process::id(),
        pipe: pipe.clone(),
        started,
        last_seen: now_ms(),
        client_count,
        preview,
        status,
    })
}

/// Handle one subscriber: greet with scrollback + connected status, then
/// pump frames in both directions until either side drops.
fn spawn_peer(
    stream: UnixStream,
    shared: Arc<Mutex<Shared>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
) {
    let (peer_id, peer_rx, greeting) = {
        let mut guard = shared.lock();
        let peer_id = guard.next_peer_id;
        guard.next_peer_id += 1;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let mut greeting = LscFrame::Scrollback {
            data: guard.ring.attach_excerpt(),
        }
        .to_line();
        greeting.push_str(
            &LscFrame::Status {
                state: SessionState::Connected,
                reason: None,
            }
            .to_line(),
        );
        guard.peers.insert(peer_id, tx);
        (peer_id, rx, greeting)
    };
    debug!(peer_id, "peer subscribed");

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(peer_write_loop(peer_id, write_half, peer_rx, greeting, shared.clone()));
    tokio::spawn(peer_read_loop(peer_id, read_half, shared, input_tx, master));
}

async fn peer_write_loop(
    peer_id: u64,
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    greeting: String,
    shared: Arc<Mutex<Shared>>,
) {
    if write_half.write_all(greeting.as_bytes()).await.is_err() {
        shared.lock().peers.remove(&peer_id);
        return;
    }
    while let Some(line) = rx.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    shared.lock().peers.remove(&peer_id);
    debug!(peer_id, "peer write loop ended");
}

async fn peer_read_loop(
    peer_id: u64,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    shared: Arc<Mutex<Shared>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > PEER_BUFFER_CAP {
            warn!(peer_id, "peer frame buffer overflow, resetting");
            buffer.clear();
            continue;
        }

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<LscFrame>(line) {
                Ok(frame) => handle_peer_frame(peer_id, frame, &shared, &input_tx, &master),
                Err(err) => {
                    debug!(peer_id, error = %err, "ignoring malformed frame");
                }
            }
        }
    }
    shared.lock().peers.remove(&peer_id);
    debug!(peer_id, "peer disconnected");
}

fn handle_peer_frame(
    peer_id: u64,
    frame: LscFrame,
    shared: &Arc<Mutex<Shared>>,
    input_tx: &mpsc::UnboundedSender<Vec<u8>>,
    master: &Arc<Mutex<Box<dyn MasterPty + Send>>>,
) {
    match frame {
        LscFrame::Input { data } => {
            let _ = input_tx.send(data.into_bytes());
        }
        LscFrame::Control { key } => {
            let _ = input_tx.send(vec![key.byte()]);
        }
        LscFrame::Resize { cols, rows } => {
            let result = master.lock().resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
            if let Err(err) = result {
                warn!(peer_id, error = %err, "PTY resize failed");
            }
        }
        LscFrame::Ping => {
            let mut guard = shared.lock();
            if let Some(tx) = guard.peers.get(&peer_id) {
                let _ = tx.send(LscFrame::Pong.to_line());
            }
        }
        // Peers never send these; log and drop rather than guessing.
        other => {
            debug!(peer_id, frame = ?other, "unexpected frame from peer");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
