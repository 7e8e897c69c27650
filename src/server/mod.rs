//! Hub server
//!
//! TLS listener serving static assets, the client WebSocket (`/`), the
//! agent WebSocket (`/agent`), and the optional GitHub webhook. Holds the
//! process-local singleton tables: the machine registry, the auth-session
//! table, and the spawned-launcher pid set, each with a documented
//! single-writer zone.

pub mod agent_ws;
pub mod headers;
pub mod http;
pub mod ratelimit;
pub mod spawn;
pub mod upload;
pub mod webhook;
pub mod ws;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth::{
    extract_query_param, timing_safe_eq, AuthSessionStore, SESSION_SWEEP_INTERVAL_SECS,
};
use crate::config::{Config, ConfigError};
use crate::machines::{MachineRegistry, SWEEP_INTERVAL_SECS};
use crate::registry::SessionRegistry;
use crate::tls;

/// Grace period before remaining connections are force-closed on shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
    #[error("configuration contains errors, aborting startup")]
    InvalidConfig,
    #[error("invalid listen address {0}")]
    BadAddress(String),
    #[error("listener failed: {0}")]
    Listener(#[from] std::io::Error),
}

/// Process-wide hub state shared across connection tasks.
#[derive(Debug)]
pub struct HubState {
    pub config: Config,
    pub auth_token: String,
    pub agent_token: Option<String>,
    pub auth_sessions: AuthSessionStore,
    pub machines: MachineRegistry,
    pub registry: SessionRegistry,
    pub launcher_pids: Mutex<HashSet<u32>>,
}

impl HubState {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let auth_token = config.require_auth_token()?.to_string();
        let agent_token = config
            .agent_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string());
        let hostname = resolve_hostname();
        Ok(Self {
            config,
            auth_token,
            agent_token,
            auth_sessions: AuthSessionStore::new(),
            machines: MachineRegistry::new(hostname),
            registry: SessionRegistry::default(),
            launcher_pids: Mutex::new(HashSet::new()),
        })
    }

    /// State for an agent's P2P listener: same protocol surface, but
    /// clients authenticate with the agent's client token and no agent
    /// endpoint is offered.
    pub fn for_agent_p2p(config: Config, client_token: String) -> Self {
        let hostname = resolve_hostname();
        Self {
            config,
            auth_token: client_token,
            agent_token: None,
            auth_sessions: AuthSessionStore::new(),
            machines: MachineRegistry::new(hostname),
            registry: SessionRegistry::default(),
            launcher_pids: Mutex::new(HashSet::new()),
        }
    }
}

pub fn resolve_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Assemble the hub router.
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/", get(http::root_handler))
        .route("/agent", get(agent_route))
        .route("/webhook/github", post(webhook::github_webhook))
        .fallback(http::static_handler)
        .layer(axum::middleware::from_fn(
            headers::security_headers_middleware,
        ))
        .with_state(state)
}

/// `/agent`: agents authenticate with the agent token before upgrade.
async fn agent_route(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    uri: Uri,
) -> Response {
    let Some(configured) = state.agent_token.as_deref() else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "agent federation is not configured" })),
        )
            .into_response();
    };
    let presented = extract_query_param(uri.query(), "token").unwrap_or_default();
    if !timing_safe_eq(&presented, configured) {
        warn!("agent upgrade rejected: token mismatch");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid agent token" })),
        )
            .into_response();
    }
    agent_ws::handle_upgrade(ws, state)
}

/// Spawn the periodic table sweepers. They stop when the shutdown signal
/// flips.
pub fn spawn_sweepers(state: Arc<HubState>, mut shutdown_rx: watch::Receiver<bool>) {
    let machines_state = state.clone();
    let mut machines_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => machines_state.machines.sweep(),
                _ = machines_shutdown.changed() => break,
            }
        }
    });

    let auth_state = state.clone();
    let mut auth_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => auth_state.auth_sessions.sweep(),
                _ = auth_shutdown.changed() => break,
            }
        }
    });

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(spawn::PID_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => spawn::sweep_dead_pids(&state.launcher_pids),
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}

/// Run the hub until a shutdown signal arrives.
pub async fn run_hub(config: Config) -> Result<(), HubError> {
    let issues = crate::config::schema::validate(&config);
    for issue in &issues {
        match issue.severity {
            crate::config::schema::Severity::Error => {
                error!("config error at {}: {}", issue.path, issue.message)
            }
            crate::config::schema::Severity::Warning => {
                warn!("config warning at {}: {}", issue.path, issue.message)
            }
        }
    }
    if crate::config::schema::has_errors(&issues) {
        return Err(HubError::InvalidConfig);
    }

    let state = Arc::new(HubState::new(config)?);
    if state.agent_token.is_none() {
        info!("agent token not configured; federation disabled");
    }

    let tls_setup = tls::setup_tls(&state.config)?;
    info!("TLS certificate: {}", tls_setup.cert_path.display());
    info!("TLS fingerprint (SHA-256): {}", tls_setup.fingerprint);

    let addr: SocketAddr = format!("{}:{}", state.config.host(), state.config.port())
        .parse()
        .map_err(|_| {
            HubError::BadAddress(format!("{}:{}", state.config.host(), state.config.port()))
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_sweepers(state.clone(), shutdown_rx);

    let app = build_router(state.clone());
    let rustls_config =
        axum_server::tls_rustls::RustlsConfig::from_config(tls_setup.server_config);
    let handle = axum_server::Handle::new();

    let shutdown_handle = handle.clone();
    let shutdown_state = state.clone();
    tokio::spawn(async move {
        let reason = await_shutdown_trigger().await;
        info!("Shutdown signal received ({})", reason);
        let _ = shutdown_tx.send(true);
        shutdown_state.machines.shutdown();
        spawn::terminate_all(&shutdown_state.launcher_pids);
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
    });

    info!("Hub listening on https://{}", addr);
    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|err| {
            error!("listener error: {}", err);
            HubError::Listener(err)
        })?;

    info!("Hub shut down");
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for
/// logging.
#[cfg(unix)]
pub async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            let _ = tokio::signal::ctrl_c().await;
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
pub async fn await_shutdown_trigger() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_config() -> Config {
        Config {
            auth_token: Some("hub-secret".to_string()),
            agent_token: Some("agent-secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn state_requires_auth_token() {
        let err = HubState::new(Config::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAuthToken));
        assert!(HubState::new(hub_config()).is_ok());
    }

    #[test]
    fn agent_token_optional() {
        let state = HubState::new(Config {
            auth_token: Some("hub-secret".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(state.agent_token.is_none());
    }

    #[test]
    fn router_builds() {
        let state = Arc::new(HubState::new(hub_config()).unwrap());
        let _router = build_router(state);
    }
}
