//! Agent runtime
//!
//! A peer-machine process that mirrors the launcher/registry surface for
//! its own host and federates with a hub: a persistent outbound WebSocket
//! (fixed 5 s reconnect) carries registration, heartbeats, and
//! project/session snapshots, while a second listener serves the same
//! client WebSocket protocol as the hub so browsers can attach directly
//! for lower-latency terminal I/O.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::projects;
use crate::protocol::{AgentToHub, HubToAgent};
use crate::registry::SessionRegistry;
use crate::server::{self, HubError, HubState};

/// Fixed reconnect delay for the hub connection.
pub const RECONNECT_SECS: u64 = 5;
/// Heartbeat cadence on an open hub connection.
pub const HEARTBEAT_SECS: u64 = 15;
/// Project/session snapshot refresh cadence.
pub const REFRESH_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid hub URL {url}: {message}")]
    BadUrl { url: String, message: String },
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Options for running an agent.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Hub agent endpoint, e.g. `wss://hub.example:8443/agent`.
    pub hub_url: String,
    /// Stable machine id; defaults to the hostname.
    pub machine_id: Option<String>,
    /// Advertised P2P address; defaults to `wss://<hostname>:<port>`.
    pub p2p_address: Option<String>,
}

/// Run the agent: P2P listener plus the hub federation loop, until a
/// shutdown signal arrives.
pub async fn run_agent(config: Config, opts: AgentOptions) -> Result<(), AgentError> {
    let agent_token = config.require_agent_token()?.to_string();
    let client_token = config
        .agent_client_token()
        .unwrap_or(agent_token.as_str())
        .to_string();

    let hostname = server::resolve_hostname();
    let machine_id = opts.machine_id.clone().unwrap_or_else(|| hostname.clone());
    let p2p_address = opts
        .p2p_address
        .clone()
        .unwrap_or_else(|| format!("wss://{}:{}", hostname, config.port()));

    let hub_url = hub_url_with_token(&opts.hub_url, &agent_token)?;
    let trust_self_signed = config.trust_self_signed.unwrap_or(false);

    // The P2P listener speaks the hub's client protocol against this
    // host's own registry.
    let p2p_state = Arc::new(HubState::for_agent_p2p(config.clone(), client_token));
    let p2p_task = tokio::spawn(run_p2p_listener(p2p_state, config.clone()));

    info!(
        machine_id = %machine_id,
        hub = %opts.hub_url,
        p2p = %p2p_address,
        "agent starting"
    );

    let registry = SessionRegistry::default();
    let federation = federation_loop(
        hub_url,
        machine_id,
        hostname,
        p2p_address,
        registry,
        config,
        trust_self_signed,
    );

    tokio::select! {
        _ = federation => {}
        result = p2p_task => {
            if let Ok(Err(err)) = result {
                return Err(AgentError::Hub(err));
            }
        }
        _ = server::await_shutdown_trigger() => {
            info!("agent shutting down");
        }
    }
    Ok(())
}

async fn run_p2p_listener(state: Arc<HubState>, config: Config) -> Result<(), HubError> {
    let tls_setup = crate::tls::setup_tls(&config)?;
    let addr: std::net::SocketAddr = format!("{}:{}", config.host(), config.port())
        .parse()
        .map_err(|_| HubError::BadAddress(format!("{}:{}", config.host(), config.port())))?;

    let app = server::build_router(state);
    let rustls_config =
        axum_server::tls_rustls::RustlsConfig::from_config(tls_setup.server_config);
    info!("P2P listener on https://{}", addr);
    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .await
        .map_err(HubError::Listener)?;
    Ok(())
}

/// Append the agent token to the hub URL's query string.
fn hub_url_with_token(hub_url: &str, token: &str) -> Result<String, AgentError> {
    let mut url = url::Url::parse(hub_url).map_err(|e| AgentError::BadUrl {
        url: hub_url.to_string(),
        message: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(AgentError::BadUrl {
                url: hub_url.to_string(),
                message: format!("expected ws:// or wss:// scheme, got {}", other),
            })
        }
    }
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

/// Reconnect-forever loop for the hub connection.
async fn federation_loop(
    hub_url: String,
    machine_id: String,
    hostname: String,
    p2p_address: String,
    registry: SessionRegistry,
    config: Config,
    trust_self_signed: bool,
) {
    loop {
        match connect_ws(&hub_url, trust_self_signed).await {
            Ok(stream) => {
                info!(machine_id = %machine_id, "connected to hub");
                run_hub_session(
                    stream,
                    &machine_id,
                    &hostname,
                    &p2p_address,
                    &registry,
                    &config,
                )
                .await;
                warn!(machine_id = %machine_id, "hub connection lost");
            }
            Err(err) => {
                debug!(error = %err, "hub connection failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(RECONNECT_SECS)).await;
    }
}

pub(crate) type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial a relay WebSocket URL, optionally trusting self-signed
/// certificates.
pub(crate) async fn connect_ws(
    hub_url: &str,
    trust_self_signed: bool,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    if trust_self_signed && hub_url.starts_with("wss://") {
        // Installing the provider is idempotent; a second call errors
        // harmlessly.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
            .with_no_client_auth();
        let connector = Connector::Rustls(Arc::new(tls_config));
        let (stream, _) =
            connect_async_tls_with_config(hub_url, None, false, Some(connector)).await?;
        Ok(stream)
    } else {
        let (stream, _) = connect_async(hub_url).await?;
        Ok(stream)
    }
}

/// One connected hub session: register, push snapshots, heartbeat, and
/// consume hub replies until the socket drops.
async fn run_hub_session(
    stream: WsStream,
    machine_id: &str,
    hostname: &str,
    p2p_address: &str,
    registry: &SessionRegistry,
    config: &Config,
) {
    let (mut sink, mut source) = stream.split();

    let register = AgentToHub::Register {
        machine_id: machine_id.to_string(),
        hostname: hostname.to_string(),
        address: p2p_address.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if send_hub(&mut sink, &register).await.is_err() {
        return;
    }
    if push_snapshots(&mut sink, machine_id, registry, config)
        .await
        .is_err()
    {
        return;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut refresh = tokio::time::interval(Duration::from_secs(REFRESH_SECS));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    refresh.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let message = AgentToHub::Heartbeat { machine_id: machine_id.to_string() };
                if send_hub(&mut sink, &message).await.is_err() {
                    return;
                }
            }
            _ = refresh.tick() => {
                if push_snapshots(&mut sink, machine_id, registry, config).await.is_err() {
                    return;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_hub_message(&text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn handle_hub_message(text: &str) {
    match serde_json::from_str::<HubToAgent>(text) {
        Ok(HubToAgent::Registered { success: true, .. }) => {
            info!("hub accepted registration");
        }
        Ok(HubToAgent::Registered {
            success: false,
            error,
        }) => {
            warn!(error = ?error, "hub rejected registration");
        }
        Ok(HubToAgent::Pong) => {}
        Err(err) => debug!(error = %err, "ignoring unrecognized hub frame"),
    }
}

async fn send_hub(
    sink: &mut futures_util::stream::SplitSink<WsStream, Message>,
    message: &AgentToHub,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(_) => return Ok(()),
    };
    sink.send(Message::Text(text)).await
}

async fn push_snapshots(
    sink: &mut futures_util::stream::SplitSink<WsStream, Message>,
    machine_id: &str,
    registry: &SessionRegistry,
    config: &Config,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let sessions = registry
        .scan()
        .iter()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect();
    let project_list = projects::list_projects(&config.projects_dir(), registry)
        .iter()
        .filter_map(|p| serde_json::to_value(p).ok())
        .collect();

    send_hub(
        sink,
        &AgentToHub::Projects {
            machine_id: machine_id.to_string(),
            projects: project_list,
        },
    )
    .await?;
    send_hub(
        sink,
        &AgentToHub::Sessions {
            machine_id: machine_id.to_string(),
            sessions,
        },
    )
    .await
}

/// Certificate verifier that accepts anything; only used when the
/// operator opted in with `trustSelfSigned` for setups where the hub runs
/// on generated certificates.
#[derive(Debug)]
struct InsecureCertVerifier;

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
