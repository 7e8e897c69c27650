//! Client runtime
//!
//! The dashboard-side state machine: one primary (hub) socket, an
//! optional agent P2P socket, per-session terminal state, demux of
//! inbound frames by session id, split panels with LRU eviction, and the
//! focus-view connection state machine.
//!
//! The runtime is transport-agnostic: the embedder owns the sockets and
//! the terminal widget. Inbound frames are fed to [`ClientRuntime::handle_raw`];
//! outbound requests accumulate in an outbox the embedder drains onto
//! whichever socket serves the selected machine. Terminal writes go
//! through the [`TerminalHost`] seam so widget wiring (including
//! disposable input handlers) stays outside this crate.

pub mod driver;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::machines::LOCAL_MACHINE_ID;
use crate::protocol::ClientRequest;
use crate::util::floor_char_boundary;

/// Scrollback is written to the widget in chunks of this size, one chunk
/// per animation tick, to keep the main thread responsive.
pub const SCROLLBACK_CHUNK_BYTES: usize = 8 * 1024;
/// Maximum simultaneous split panels.
pub const MAX_SPLIT_PANELS: usize = 4;
/// Reconnect backoff bounds.
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);
const RECONNECT_FACTOR: f64 = 1.5;

/// Widget-side operations the runtime drives.
pub trait TerminalHost {
    /// Write output to the focus terminal.
    fn write_focus(&mut self, data: &str);
    /// Write output to a session's split panel.
    fn write_split(&mut self, session_id: &str, data: &str);
    /// Detach the input handler for the previously focused session.
    fn dispose_input(&mut self);
    /// Attach the input handler for the newly focused session.
    fn attach_input(&mut self, session_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Machines,
    Dashboard,
    Split,
    Focus,
}

/// Focus-view connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    Dashboard,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Default, Clone)]
pub struct SessionView {
    pub connected: bool,
    pub activity_ms: u64,
}

/// Exponential reconnect backoff: 5 s growing by 1.5x, capped at 60 s.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    current: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            current: RECONNECT_INITIAL,
        }
    }

    /// The delay before the next redial, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * RECONNECT_FACTOR;
        self.current = Duration::from_secs_f64(grown.min(RECONNECT_MAX.as_secs_f64()));
        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = RECONNECT_INITIAL;
    }
}

/// Split panel set with LRU eviction.
#[derive(Debug, Default)]
struct SplitPanels {
    /// Most recently used last.
    order: Vec<String>,
}

impl SplitPanels {
    fn contains(&self, session_id: &str) -> bool {
        self.order.iter().any(|id| id == session_id)
    }

    fn touch(&mut self, session_id: &str) {
        self.order.retain(|id| id != session_id);
        self.order.push(session_id.to_string());
    }

    /// Add a panel; returns the evicted session when over the cap.
    fn open(&mut self, session_id: &str) -> Option<String> {
        self.touch(session_id);
        if self.order.len() > MAX_SPLIT_PANELS {
            Some(self.order.remove(0))
        } else {
            None
        }
    }

    fn close(&mut self, session_id: &str) {
        self.order.retain(|id| id != session_id);
    }
}

/// The dashboard state machine.
pub struct ClientRuntime<H: TerminalHost> {
    host: H,
    view: View,
    selected_machine: String,
    pub available_machines: Vec<Value>,
    pub available_projects: Vec<Value>,
    pub available_sessions: Vec<Value>,
    sessions: HashMap<String, SessionView>,
    focused: Option<String>,
    focus_state: FocusState,
    splits: SplitPanels,
    /// Scrollback chunks awaiting their animation tick.
    pending_scrollback: VecDeque<(String, String)>,
    /// Requests the embedder must flush to the active socket.
    outbox: VecDeque<ClientRequest>,
    pub backoff: ReconnectBackoff,
}

impl<H: TerminalHost> ClientRuntime<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            view: View::Dashboard,
            selected_machine: LOCAL_MACHINE_ID.to_string(),
            available_machines: Vec::new(),
            available_projects: Vec::new(),
            available_sessions: Vec::new(),
            sessions: HashMap::new(),
            focused: None,
            focus_state: FocusState::Dashboard,
            splits: SplitPanels::default(),
            pending_scrollback: VecDeque::new(),
            outbox: VecDeque::new(),
            backoff: ReconnectBackoff::new(),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn focus_state(&self) -> FocusState {
        self.focus_state
    }

    pub fn focused_session(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn selected_machine(&self) -> &str {
        &self.selected_machine
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionView> {
        self.sessions.get(session_id)
    }

    /// Drain the outbound request queue.
    pub fn take_outbox(&mut self) -> Vec<ClientRequest> {
        self.outbox.drain(..).collect()
    }

    /// Boot-time machine restoration: re-select the persisted machine only
    /// when the machine list reports it connected.
    pub fn boot_select(&mut self, persisted: Option<&str>) {
        let Some(persisted) = persisted else {
            return;
        };
        let connected = self.available_machines.iter().any(|m| {
            m.get("id").and_then(|v| v.as_str()) == Some(persisted)
                && m.get("status").and_then(|v| v.as_str()) == Some("connected")
        });
        if connected {
            self.selected_machine = persisted.to_string();
            debug!(machine = %persisted, "restored persisted machine selection");
        }
    }

    /// Select a machine. Returns the P2P address the embedder must dial,
    /// or `None` when the hub socket serves the selection.
    pub fn select_machine(&mut self, machine_id: &str) -> Option<String> {
        self.selected_machine = machine_id.to_string();
        self.view = View::Dashboard;
        if machine_id == LOCAL_MACHINE_ID {
            return None;
        }
        self.available_machines
            .iter()
            .find(|m| m.get("id").and_then(|v| v.as_str()) == Some(machine_id))
            .and_then(|m| m.get("address").and_then(|v| v.as_str()))
            .map(|a| a.to_string())
    }

    /// Open the focus view on a session. Returning to the already-focused
    /// session skips the reconnect round-trip.
    pub fn open_focus(&mut self, session_id: &str) {
        self.view = View::Focus;
        if self.focused.as_deref() == Some(session_id) {
            return;
        }
        // Keystrokes must never leak into the previous session.
        self.host.dispose_input();
        self.focused = Some(session_id.to_string());
        self.host.attach_input(session_id);
        self.focus_state = FocusState::Connecting;
        self.outbox.push_back(ClientRequest::ConnectSession {
            session_id: session_id.to_string(),
        });
    }

    /// Leave the focus view for the dashboard.
    pub fn back_to_dashboard(&mut self) {
        self.view = View::Dashboard;
        self.focus_state = FocusState::Dashboard;
    }

    /// Open a split panel. The least-recently-used panel is evicted past
    /// the cap; the evicted id is returned so the embedder can drop its
    /// widget.
    pub fn open_split(&mut self, session_id: &str) -> Option<String> {
        self.view = View::Split;
        let evicted = self.splits.open(session_id);
        self.outbox.push_back(ClientRequest::ConnectSession {
            session_id: session_id.to_string(),
        });
        evicted
    }

    pub fn close_split(&mut self, session_id: &str) {
        self.splits.close(session_id);
    }

    pub fn split_panels(&self) -> &[String] {
        &self.splits.order
    }

    /// Whether dashboard rerenders should be throttled (a chunked
    /// scrollback write is in flight).
    pub fn dashboard_throttled(&self) -> bool {
        !self.pending_scrollback.is_empty()
    }

    /// Write one pending scrollback chunk; call once per animation frame.
    /// Returns false when nothing is pending.
    pub fn on_animation_tick(&mut self) -> bool {
        let Some((session_id, chunk)) = self.pending_scrollback.pop_front() else {
            return false;
        };
        self.write_terminal(&session_id, &chunk);
        true
    }

    /// Feed one raw inbound frame (from either socket; both speak the
    /// same protocol).
    pub fn handle_raw(&mut self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            debug!("ignoring unparseable frame");
            return;
        };
        let Some(frame_type) = value.get("type").and_then(|t| t.as_str()) else {
            debug!("ignoring untyped frame");
            return;
        };

        match frame_type {
            "output" => {
                let session_id = self.frame_session_id(&value);
                let data = value
                    .get("data")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(session_id) = session_id {
                    self.on_output(&session_id, &data);
                }
            }
            "scrollback" => {
                let session_id = self.frame_session_id(&value);
                let data = value
                    .get("data")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(session_id) = session_id {
                    self.on_scrollback(&session_id, &data);
                }
            }
            "status" => {
                let session_id = self.frame_session_id(&value);
                let state = value
                    .get("state")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(session_id) = session_id {
                    self.on_status(&session_id, &state);
                }
            }
            "sessions" => {
                self.available_sessions = value
                    .get("sessions")
                    .and_then(|s| s.as_array())
                    .cloned()
                    .unwrap_or_default();
            }
            "projects" => {
                self.available_projects = value
                    .get("projects")
                    .and_then(|p| p.as_array())
                    .cloned()
                    .unwrap_or_default();
            }
            "machines" => {
                self.available_machines = value
                    .get("machines")
                    .and_then(|m| m.as_array())
                    .cloned()
                    .unwrap_or_default();
            }
            "folders" | "pong" | "upload_result" | "create_session_result"
            | "start_folder_session_result" => {}
            "error" => {
                warn!(
                    message = value.get("message").and_then(|m| m.as_str()).unwrap_or(""),
                    "server error"
                );
            }
            other => {
                // Unknown tags are a no-op on the client.
                debug!(frame_type = other, "ignoring unknown frame type");
            }
        }
    }

    /// Session id for an output/scrollback/status frame. A missing id is
    /// tolerated with a warning and the last-focused session.
    fn frame_session_id(&self, value: &Value) -> Option<String> {
        match value.get("sessionId").and_then(|s| s.as_str()) {
            Some(id) => Some(id.to_string()),
            None => {
                warn!("frame missing sessionId, falling back to focused session");
                self.focused.clone()
            }
        }
    }

    fn on_output(&mut self, session_id: &str, data: &str) {
        let view = self.sessions.entry(session_id.to_string()).or_default();
        view.activity_ms = crate::util::now_ms();

        if self.focused.as_deref() == Some(session_id)
            && self.focus_state == FocusState::Connecting
        {
            self.focus_state = FocusState::Connected;
        }
        self.write_terminal(session_id, data);
    }

    fn on_scrollback(&mut self, session_id: &str, data: &str) {
        if self.focused.as_deref() == Some(session_id)
            && self.focus_state == FocusState::Connecting
        {
            self.focus_state = FocusState::Connected;
        }
        for chunk in chunk_utf8(data, SCROLLBACK_CHUNK_BYTES) {
            self.pending_scrollback
                .push_back((session_id.to_string(), chunk));
        }
    }

    fn on_status(&mut self, session_id: &str, state: &str) {
        let view = self.sessions.entry(session_id.to_string()).or_default();
        match state {
            "connected" => {
                view.connected = true;
                if self.focused.as_deref() == Some(session_id)
                    && self.focus_state == FocusState::Connecting
                {
                    self.focus_state = FocusState::Connected;
                }
            }
            "disconnected" => {
                view.connected = false;
                if self.focused.as_deref() == Some(session_id) {
                    // Dashboard rendering continues; the session may
                    // reappear in a later registry scan.
                    self.focus_state = FocusState::Disconnected;
                }
            }
            _ => {}
        }
    }

    fn write_terminal(&mut self, session_id: &str, data: &str) {
        if self.focused.as_deref() == Some(session_id) {
            self.host.write_focus(data);
        }
        if self.splits.contains(session_id) {
            self.host.write_split(session_id, data);
        }
    }
}

/// Split a string into chunks of at most `max` bytes on char boundaries.
fn chunk_utf8(data: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let mut cut = floor_char_boundary(rest, max);
        if cut == 0 {
            cut = rest.chars().next().map(|c| c.len_utf8()).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        focus_writes: Vec<String>,
        split_writes: Vec<(String, String)>,
        input_attached: Vec<String>,
        input_disposed: usize,
    }

    impl TerminalHost for RecordingHost {
        fn write_focus(&mut self, data: &str) {
            self.focus_writes.push(data.to_string());
        }
        fn write_split(&mut self, session_id: &str, data: &str) {
            self.split_writes
                .push((session_id.to_string(), data.to_string()));
        }
        fn dispose_input(&mut self) {
            self.input_disposed += 1;
        }
        fn attach_input(&mut self, session_id: &str) {
            self.input_attached.push(session_id.to_string());
        }
    }

    fn runtime() -> ClientRuntime<RecordingHost> {
        ClientRuntime::new(RecordingHost::default())
    }

    #[test]
    fn focus_flow_reaches_connected() {
        let mut rt = runtime();
        rt.open_focus("proj");
        assert_eq!(rt.focus_state(), FocusState::Connecting);
        assert!(matches!(
            rt.take_outbox().as_slice(),
            [ClientRequest::ConnectSession { session_id }] if session_id == "proj"
        ));

        rt.handle_raw(r#"{"type":"status","sessionId":"proj","state":"connected"}"#);
        assert_eq!(rt.focus_state(), FocusState::Connected);
        assert!(rt.session("proj").unwrap().connected);
    }

    #[test]
    fn refocusing_same_session_skips_reconnect() {
        let mut rt = runtime();
        rt.open_focus("proj");
        rt.take_outbox();
        rt.open_focus("proj");
        assert!(rt.take_outbox().is_empty());
        assert_eq!(rt.host.input_attached.len(), 1);
    }

    #[test]
    fn switching_focus_disposes_input_handler() {
        let mut rt = runtime();
        rt.open_focus("a");
        rt.open_focus("b");
        assert_eq!(rt.host.input_disposed, 2);
        assert_eq!(rt.host.input_attached, vec!["a", "b"]);
    }

    #[test]
    fn output_routes_to_focus_terminal_only_when_focused() {
        let mut rt = runtime();
        rt.open_focus("proj");
        rt.handle_raw(r#"{"type":"output","sessionId":"proj","data":"hi"}"#);
        rt.handle_raw(r#"{"type":"output","sessionId":"other","data":"nope"}"#);
        assert_eq!(rt.host.focus_writes, vec!["hi"]);
    }

    #[test]
    fn output_reaches_split_panel() {
        let mut rt = runtime();
        rt.open_split("proj");
        rt.handle_raw(r#"{"type":"output","sessionId":"proj","data":"hi"}"#);
        assert_eq!(rt.host.split_writes, vec![("proj".to_string(), "hi".to_string())]);
    }

    #[test]
    fn missing_session_id_falls_back_to_focused() {
        let mut rt = runtime();
        rt.open_focus("proj");
        rt.handle_raw(r#"{"type":"output","data":"legacy"}"#);
        assert_eq!(rt.host.focus_writes, vec!["legacy"]);
    }

    #[test]
    fn status_disconnected_moves_focus_state() {
        let mut rt = runtime();
        rt.open_focus("proj");
        rt.handle_raw(r#"{"type":"status","sessionId":"proj","state":"connected"}"#);
        rt.handle_raw(
            r#"{"type":"status","sessionId":"proj","state":"disconnected","reason":"gone"}"#,
        );
        assert_eq!(rt.focus_state(), FocusState::Disconnected);
        assert!(!rt.session("proj").unwrap().connected);
    }

    #[test]
    fn scrollback_is_chunked_and_paced() {
        let mut rt = runtime();
        rt.open_focus("proj");
        let big = "x".repeat(SCROLLBACK_CHUNK_BYTES * 2 + 100);
        let frame = serde_json::json!({
            "type": "scrollback",
            "sessionId": "proj",
            "data": big,
        });
        rt.handle_raw(&frame.to_string());

        assert!(rt.dashboard_throttled());
        assert!(rt.host.focus_writes.is_empty());

        let mut ticks = 0;
        while rt.on_animation_tick() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
        assert!(!rt.dashboard_throttled());
        let total: usize = rt.host.focus_writes.iter().map(|w| w.len()).sum();
        assert_eq!(total, SCROLLBACK_CHUNK_BYTES * 2 + 100);
    }

    #[test]
    fn split_panels_evict_lru_past_cap() {
        let mut rt = runtime();
        assert_eq!(rt.open_split("a"), None);
        assert_eq!(rt.open_split("b"), None);
        assert_eq!(rt.open_split("c"), None);
        assert_eq!(rt.open_split("d"), None);
        // Touch "a" so "b" becomes least recently used.
        assert_eq!(rt.open_split("a"), None);
        assert_eq!(rt.open_split("e"), Some("b".to_string()));
        assert_eq!(rt.split_panels().len(), MAX_SPLIT_PANELS);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = ReconnectBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        let second = backoff.next_delay();
        assert!(second > Duration::from_secs(5));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), RECONNECT_MAX);
        backoff.reset();
        assert_eq!(backoff.next_delay(), RECONNECT_INITIAL);
    }

    #[test]
    fn boot_select_requires_connected_machine() {
        let mut rt = runtime();
        rt.available_machines = vec![
            serde_json::json!({"id": "A", "status": "disconnected"}),
            serde_json::json!({"id": "B", "status": "connected"}),
        ];
        rt.boot_select(Some("A"));
        assert_eq!(rt.selected_machine(), LOCAL_MACHINE_ID);
        rt.boot_select(Some("B"));
        assert_eq!(rt.selected_machine(), "B");
    }

    #[test]
    fn select_remote_machine_returns_p2p_address() {
        let mut rt = runtime();
        rt.available_machines = vec![serde_json::json!({
            "id": "A",
            "status": "connected",
            "address": "wss://a:9443",
        })];
        assert_eq!(rt.select_machine("A").as_deref(), Some("wss://a:9443"));
        assert_eq!(rt.select_machine(LOCAL_MACHINE_ID), None);
    }

    #[test]
    fn unknown_frame_is_noop() {
        let mut rt = runtime();
        rt.handle_raw(r#"{"type":"mystery","data":"?"}"#);
        rt.handle_raw("not json");
        assert!(rt.host.focus_writes.is_empty());
    }

    #[test]
    fn machine_list_updates() {
        let mut rt = runtime();
        rt.handle_raw(r#"{"type":"machines","machines":[{"id":"LOCAL"},{"id":"A"}]}"#);
        assert_eq!(rt.available_machines.len(), 2);
    }
}
