//! Machine registry
//!
//! In-memory fleet catalog kept by the hub: the local machine plus every
//! registered agent. Mutated only by agent-connection tasks and the
//! sweeper; client-facing paths read snapshots.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::protocol::{CLOSE_GOING_AWAY, CLOSE_NORMAL};
use crate::util::now_ms;

/// Reserved id of the hub's own machine record.
pub const LOCAL_MACHINE_ID: &str = "LOCAL";

/// No heartbeat for this long flips a machine to disconnected.
pub const HEARTBEAT_STALE_MS: u64 = 45_000;
/// Disconnected for this long removes the record entirely.
pub const REMOVE_AFTER_MS: u64 = 60 * 60 * 1000;
/// Cadence of the background sweep.
pub const SWEEP_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Error, PartialEq)]
pub enum RegisterError {
    #[error("machine id {0:?} is reserved")]
    ReservedId(String),
    #[error("machine id must not be empty")]
    EmptyId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Connected,
    Disconnected,
}

/// One machine's registry entry.
#[derive(Debug)]
struct MachineEntry {
    id: String,
    hostname: String,
    /// WebSocket URL for direct P2P client connections (remote only).
    address: Option<String>,
    is_local: bool,
    agent_version: Option<String>,
    last_seen: u64,
    status: MachineStatus,
    projects: Vec<Value>,
    sessions: Vec<Value>,
    /// Live agent socket, present while connected remotely.
    sender: Option<mpsc::UnboundedSender<Message>>,
    /// Identifies which connection owns `sender`; a stale disconnect from
    /// an already-replaced connection is ignored.
    conn_id: Option<String>,
}

/// Snapshot shape returned to clients for `list_machines`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSummary {
    pub id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub is_local: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    pub status: MachineStatus,
    pub last_seen: u64,
    pub project_count: usize,
    pub session_count: usize,
    pub projects: Vec<Value>,
    pub sessions: Vec<Value>,
}

#[derive(Debug)]
pub struct MachineRegistry {
    machines: Mutex<HashMap<String, MachineEntry>>,
}

impl MachineRegistry {
    /// Create the registry with the always-present local record.
    pub fn new(hostname: String) -> Self {
        let mut machines = HashMap::new();
        machines.insert(
            LOCAL_MACHINE_ID.to_string(),
            MachineEntry {
                id: LOCAL_MACHINE_ID.to_string(),
                hostname,
                address: None,
                is_local: true,
                agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                last_seen: now_ms(),
                status: MachineStatus::Connected,
                projects: Vec::new(),
                sessions: Vec::new(),
                sender: None,
                conn_id: None,
            },
        );
        Self {
            machines: Mutex::new(machines),
        }
    }

    /// Register (or re-register) a remote agent.
    ///
    /// Returns the previous connection's sender when an open connection for
    /// the same id existed; the caller must close it with code 4000.
    pub fn register_agent(
        &self,
        machine_id: &str,
        hostname: String,
        address: String,
        agent_version: String,
        sender: mpsc::UnboundedSender<Message>,
        conn_id: String,
    ) -> Result<Option<mpsc::UnboundedSender<Message>>, RegisterError> {
        if machine_id.is_empty() {
            return Err(RegisterError::EmptyId);
        }
        if machine_id.eq_ignore_ascii_case(LOCAL_MACHINE_ID) {
            return Err(RegisterError::ReservedId(machine_id.to_string()));
        }

        let mut machines = self.machines.lock();
        let now = now_ms();
        let replaced = match machines.get_mut(machine_id) {
            Some(entry) => {
                let old = entry.sender.take();
                entry.hostname = hostname;
                entry.address = Some(address);
                entry.agent_version = Some(agent_version);
                entry.last_seen = now;
                entry.status = MachineStatus::Connected;
                entry.sender = Some(sender);
                entry.conn_id = Some(conn_id);
                old
            }
            None => {
                machines.insert(
                    machine_id.to_string(),
                    MachineEntry {
                        id: machine_id.to_string(),
                        hostname,
                        address: Some(address),
                        is_local: false,
                        agent_version: Some(agent_version),
                        last_seen: now,
                        status: MachineStatus::Connected,
                        projects: Vec::new(),
                        sessions: Vec::new(),
                        sender: Some(sender),
                        conn_id: Some(conn_id),
                    },
                );
                None
            }
        };
        Ok(replaced)
    }

    /// Merge a projects snapshot into a machine's entry.
    pub fn update_projects(&self, machine_id: &str, projects: Vec<Value>) {
        let mut machines = self.machines.lock();
        if let Some(entry) = machines.get_mut(machine_id) {
            if entry.projects.len() != projects.len() {
                info!(
                    machine_id = %machine_id,
                    count = projects.len(),
                    "agent project count changed"
                );
            }
            entry.projects = projects;
            entry.last_seen = now_ms();
        }
    }

    /// Merge a sessions snapshot into a machine's entry.
    pub fn update_sessions(&self, machine_id: &str, sessions: Vec<Value>) {
        let mut machines = self.machines.lock();
        if let Some(entry) = machines.get_mut(machine_id) {
            if entry.sessions.len() != sessions.len() {
                info!(
                    machine_id = %machine_id,
                    count = sessions.len(),
                    "agent session count changed"
                );
            }
            entry.sessions = sessions;
            entry.last_seen = now_ms();
        }
    }

    /// Record a heartbeat. Returns false for unknown machines.
    pub fn heartbeat(&self, machine_id: &str) -> bool {
        let mut machines = self.machines.lock();
        match machines.get_mut(machine_id) {
            Some(entry) => {
                entry.last_seen = now_ms();
                true
            }
            None => false,
        }
    }

    /// Refresh the local record's projects/sessions snapshots.
    pub fn refresh_local(&self, projects: Vec<Value>, sessions: Vec<Value>) {
        let mut machines = self.machines.lock();
        if let Some(entry) = machines.get_mut(LOCAL_MACHINE_ID) {
            entry.projects = projects;
            entry.sessions = sessions;
            entry.last_seen = now_ms();
        }
    }

    /// Mark a machine disconnected when its socket task ends. Ignored if a
    /// newer connection already replaced this one.
    pub fn mark_disconnected(&self, machine_id: &str, conn_id: &str) {
        let mut machines = self.machines.lock();
        if let Some(entry) = machines.get_mut(machine_id) {
            if entry.conn_id.as_deref() == Some(conn_id) {
                entry.status = MachineStatus::Disconnected;
                entry.sender = None;
                entry.conn_id = None;
            }
        }
    }

    /// One sweep pass: machines silent past the heartbeat window flip to
    /// disconnected (their sockets are closed); records disconnected past
    /// the removal window are dropped. The local record is never touched.
    pub fn sweep(&self) {
        let now = now_ms();
        let mut machines = self.machines.lock();
        let mut remove = Vec::new();
        for (id, entry) in machines.iter_mut() {
            if entry.is_local {
                continue;
            }
            let silent = now.saturating_sub(entry.last_seen);
            if entry.status == MachineStatus::Connected && silent > HEARTBEAT_STALE_MS {
                info!(machine_id = %id, silent_ms = silent, "agent heartbeat lost");
                entry.status = MachineStatus::Disconnected;
                if let Some(sender) = entry.sender.take() {
                    let _ = sender.send(Message::Close(Some(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: "heartbeat lost".into(),
                    })));
                }
                entry.conn_id = None;
            }
            if entry.status == MachineStatus::Disconnected && silent > REMOVE_AFTER_MS {
                remove.push(id.clone());
            }
        }
        for id in remove {
            info!(machine_id = %id, "removing expired machine record");
            machines.remove(&id);
        }
    }

    /// Close every agent socket (hub shutdown).
    pub fn shutdown(&self) {
        let mut machines = self.machines.lock();
        for entry in machines.values_mut() {
            if let Some(sender) = entry.sender.take() {
                let _ = sender.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "hub shutting down".into(),
                })));
            }
            if !entry.is_local {
                entry.status = MachineStatus::Disconnected;
            }
            entry.conn_id = None;
        }
    }

    /// Snapshot for `list_machines`, local machine first.
    pub fn list(&self) -> Vec<MachineSummary> {
        let machines = self.machines.lock();
        let mut out: Vec<MachineSummary> = machines
            .values()
            .map(|entry| MachineSummary {
                id: entry.id.clone(),
                hostname: entry.hostname.clone(),
                address: entry.address.clone(),
                is_local: entry.is_local,
                agent_version: entry.agent_version.clone(),
                status: entry.status,
                last_seen: entry.last_seen,
                project_count: entry.projects.len(),
                session_count: entry.sessions.len(),
                projects: entry.projects.clone(),
                sessions: entry.sessions.clone(),
            })
            .collect();
        out.sort_by(|a, b| b.is_local.cmp(&a.is_local).then(a.id.cmp(&b.id)));
        out
    }

    #[cfg(test)]
    fn force_last_seen(&self, machine_id: &str, last_seen: u64) {
        let mut machines = self.machines.lock();
        if let Some(entry) = machines.get_mut(machine_id) {
            entry.last_seen = last_seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        mpsc::unbounded_channel()
    }

    fn registry() -> MachineRegistry {
        MachineRegistry::new("hub-host".to_string())
    }

    #[test]
    fn local_record_always_present() {
        let reg = registry();
        let list = reg.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, LOCAL_MACHINE_ID);
        assert!(list[0].is_local);
        assert_eq!(list[0].status, MachineStatus::Connected);
    }

    #[test]
    fn remote_cannot_claim_local_id() {
        let reg = registry();
        let (tx, _rx) = sender();
        let err = reg
            .register_agent(
                "LOCAL",
                "h".into(),
                "wss://h:1".into(),
                "0.1".into(),
                tx,
                "c1".into(),
            )
            .unwrap_err();
        assert!(matches!(err, RegisterError::ReservedId(_)));

        let (tx, _rx) = sender();
        let err = reg
            .register_agent(
                "local",
                "h".into(),
                "wss://h:1".into(),
                "0.1".into(),
                tx,
                "c1".into(),
            )
            .unwrap_err();
        assert!(matches!(err, RegisterError::ReservedId(_)));
    }

    #[test]
    fn duplicate_registration_returns_old_sender() {
        let reg = registry();
        let (tx1, mut rx1) = sender();
        let replaced = reg
            .register_agent(
                "A",
                "h".into(),
                "wss://a:1".into(),
                "0.1".into(),
                tx1,
                "c1".into(),
            )
            .unwrap();
        assert!(replaced.is_none());

        let (tx2, _rx2) = sender();
        let replaced = reg
            .register_agent(
                "A",
                "h".into(),
                "wss://a:1".into(),
                "0.1".into(),
                tx2,
                "c2".into(),
            )
            .unwrap();
        let old = replaced.expect("old sender returned");
        let _ = old.send(Message::Close(Some(CloseFrame {
            code: crate::protocol::CLOSE_REPLACED,
            reason: "replaced".into(),
        })));
        assert!(matches!(rx1.try_recv(), Ok(Message::Close(_))));
    }

    #[test]
    fn stale_disconnect_from_replaced_conn_is_ignored() {
        let reg = registry();
        let (tx1, _rx1) = sender();
        reg.register_agent("A", "h".into(), "a".into(), "0.1".into(), tx1, "c1".into())
            .unwrap();
        let (tx2, _rx2) = sender();
        reg.register_agent("A", "h".into(), "a".into(), "0.1".into(), tx2, "c2".into())
            .unwrap();

        // The replaced connection's teardown must not disconnect the new one.
        reg.mark_disconnected("A", "c1");
        let a = reg.list().into_iter().find(|m| m.id == "A").unwrap();
        assert_eq!(a.status, MachineStatus::Connected);

        reg.mark_disconnected("A", "c2");
        let a = reg.list().into_iter().find(|m| m.id == "A").unwrap();
        assert_eq!(a.status, MachineStatus::Disconnected);
    }

    #[test]
    fn sweep_flips_silent_machines_and_removes_expired() {
        let reg = registry();
        let (tx, mut rx) = sender();
        reg.register_agent("A", "h".into(), "a".into(), "0.1".into(), tx, "c1".into())
            .unwrap();

        reg.force_last_seen("A", now_ms() - HEARTBEAT_STALE_MS - 1_000);
        reg.sweep();
        let a = reg.list().into_iter().find(|m| m.id == "A").unwrap();
        assert_eq!(a.status, MachineStatus::Disconnected);
        // A silent agent is closed normally, never with the replaced code.
        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, CLOSE_NORMAL),
            other => panic!("expected close frame, got {:?}", other),
        }

        reg.force_last_seen("A", now_ms() - REMOVE_AFTER_MS - 1_000);
        reg.sweep();
        assert!(reg.list().into_iter().all(|m| m.id != "A"));
    }

    #[test]
    fn sweep_never_touches_local() {
        let reg = registry();
        reg.force_last_seen(LOCAL_MACHINE_ID, 0);
        reg.sweep();
        let local = reg.list().into_iter().next().unwrap();
        assert_eq!(local.status, MachineStatus::Connected);
    }

    #[test]
    fn session_counts_reported() {
        let reg = registry();
        let (tx, _rx) = sender();
        reg.register_agent("A", "h".into(), "a".into(), "0.1".into(), tx, "c1".into())
            .unwrap();
        reg.update_sessions("A", vec![serde_json::json!({"id": "sA"})]);

        let a = reg.list().into_iter().find(|m| m.id == "A").unwrap();
        assert_eq!(a.session_count, 1);
    }

    #[test]
    fn heartbeat_unknown_machine_is_false() {
        let reg = registry();
        assert!(!reg.heartbeat("ghost"));
        assert!(reg.heartbeat(LOCAL_MACHINE_ID));
    }
}
