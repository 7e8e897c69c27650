//! Agent WebSocket handler (`/agent`).
//!
//! Agents authenticate with the agent token before the upgrade; a
//! mismatch is rejected with 401 and never reaches this handler. A
//! registration for an already-connected machine id force-closes the
//! older socket with code 4000.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{AgentToHub, HubToAgent, CLOSE_REPLACED};
use crate::server::HubState;

pub fn handle_upgrade(ws: WebSocketUpgrade, state: Arc<HubState>) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    let conn_id = uuid::Uuid::new_v4().to_string();
    let mut registered_machine: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message = match serde_json::from_str::<AgentToHub>(&text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "ignoring unrecognized agent frame");
                continue;
            }
        };
        match message {
            AgentToHub::Register {
                machine_id,
                hostname,
                address,
                agent_version,
            } => {
                match state.machines.register_agent(
                    &machine_id,
                    hostname,
                    address,
                    agent_version,
                    tx.clone(),
                    conn_id.clone(),
                ) {
                    Ok(replaced) => {
                        if let Some(old) = replaced {
                            info!(machine_id = %machine_id, "replacing older agent connection");
                            let _ = old.send(Message::Close(Some(CloseFrame {
                                code: CLOSE_REPLACED,
                                reason: "replaced by newer connection".into(),
                            })));
                        }
                        info!(machine_id = %machine_id, "agent registered");
                        registered_machine = Some(machine_id);
                        send_agent(&tx, &HubToAgent::Registered {
                            success: true,
                            error: None,
                        });
                    }
                    Err(err) => {
                        warn!(machine_id = %machine_id, error = %err, "agent registration rejected");
                        send_agent(&tx, &HubToAgent::Registered {
                            success: false,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
            AgentToHub::Projects {
                machine_id,
                projects,
            } => {
                state.machines.update_projects(&machine_id, projects);
            }
            AgentToHub::Sessions {
                machine_id,
                sessions,
            } => {
                state.machines.update_sessions(&machine_id, sessions);
            }
            AgentToHub::Heartbeat { machine_id } => {
                if !state.machines.heartbeat(&machine_id) {
                    debug!(machine_id = %machine_id, "heartbeat from unregistered machine");
                }
                send_agent(&tx, &HubToAgent::Pong);
            }
        }
    }

    if let Some(machine_id) = registered_machine {
        info!(machine_id = %machine_id, "agent connection closed");
        state.machines.mark_disconnected(&machine_id, &conn_id);
    }
    drop(tx);
    let _ = send_task.await;
}

fn send_agent(tx: &mpsc::UnboundedSender<Message>, message: &HubToAgent) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = tx.send(Message::Text(text));
    }
}
