//! Wire protocol types
//!
//! Three tagged-union families share the `type` discriminant:
//! - client ⇄ hub/agent WebSocket frames ([`ClientRequest`] / [`ClientEvent`])
//! - agent ⇄ hub federation frames ([`AgentToHub`] / [`HubToAgent`])
//! - the newline-delimited local session channel ([`LscFrame`])
//!
//! LSC frames never carry a session id (the channel is per-session); the hub
//! stamps `sessionId` onto every `output`/`scrollback`/`status` frame before
//! forwarding to a client. Unknown tags fail deserialization; dispatchers
//! log and drop them rather than guessing a handler.

use serde::{Deserialize, Serialize};

/// WebSocket close code for authentication failure.
pub const CLOSE_AUTH_FAILURE: u16 = 4001;
/// WebSocket close code when a newer connection replaces this one. Never
/// sent for any other condition; agents key reconnect suppression on it.
pub const CLOSE_REPLACED: u16 = 4000;
/// WebSocket close code sent to agents on hub shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Plain normal closure, used when the hub drops a silent agent.
pub const CLOSE_NORMAL: u16 = 1000;

/// Control keys a client may inject into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKey {
    #[serde(rename = "CTRL_C")]
    CtrlC,
    #[serde(rename = "CTRL_D")]
    CtrlD,
    #[serde(rename = "ESC")]
    Esc,
}

impl ControlKey {
    /// The canonical byte written into the PTY for this key.
    pub fn byte(self) -> u8 {
        match self {
            ControlKey::CtrlC => 0x03,
            ControlKey::CtrlD => 0x04,
            ControlKey::Esc => 0x1b,
        }
    }
}

/// Session liveness state as advertised in registry records and
/// `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Idle,
    Interactive,
    Running,
    Disconnected,
}

/// Requests a client sends to the hub (or directly to an agent's P2P
/// listener, which speaks the identical protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    Ping,
    ListMachines,
    ListProjects,
    ListSessions,
    ListFolders,
    ConnectSession {
        session_id: String,
    },
    Input {
        data: String,
    },
    Control {
        key: ControlKey,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    UploadFile {
        session_id: String,
        filename: String,
        /// Base64-encoded file contents.
        data: String,
        size: u64,
    },
    CreateSession {
        project_name: String,
    },
    StartFolderSession {
        folder_name: String,
        #[serde(default)]
        skip_permissions: bool,
    },
}

/// Events and responses the hub (or agent P2P listener) sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Pong,
    Machines {
        machines: Vec<serde_json::Value>,
    },
    Projects {
        projects: Vec<serde_json::Value>,
    },
    Sessions {
        sessions: Vec<serde_json::Value>,
    },
    Folders {
        folders: Vec<serde_json::Value>,
    },
    Output {
        session_id: String,
        data: String,
    },
    Scrollback {
        session_id: String,
        data: String,
    },
    Status {
        session_id: String,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    UploadResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CreateSessionResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StartFolderSessionResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        folder_name: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        already_running: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Frames on the local session channel between a launcher and its
/// subscribers. Newline-delimited JSON; no session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LscFrame {
    Scrollback {
        data: String,
    },
    Output {
        data: String,
    },
    Status {
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Input {
        data: String,
    },
    Control {
        key: ControlKey,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Ping,
    Pong,
}

impl LscFrame {
    /// Serialize to a single newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// Messages an agent sends over its persistent hub connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AgentToHub {
    #[serde(rename = "agent:register")]
    Register {
        machine_id: String,
        hostname: String,
        /// WebSocket URL at which this agent accepts direct client connections.
        address: String,
        agent_version: String,
    },
    #[serde(rename = "agent:projects")]
    Projects {
        machine_id: String,
        projects: Vec<serde_json::Value>,
    },
    #[serde(rename = "agent:sessions")]
    Sessions {
        machine_id: String,
        sessions: Vec<serde_json::Value>,
    },
    #[serde(rename = "agent:heartbeat")]
    Heartbeat { machine_id: String },
}

/// Messages the hub sends back to a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum HubToAgent {
    #[serde(rename = "hub:registered")]
    Registered {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "hub:pong")]
    Pong,
}
