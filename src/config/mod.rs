//! Configuration loading
//!
//! Typed configuration read from `~/.claude-relay/config.json` (override
//! with `CLAUDE_RELAY_CONFIG`), with environment overrides for secrets:
//!
//! - `CLAUDE_RELAY_TOKEN` - client bearer token
//! - `CLAUDE_RELAY_AGENT_TOKEN` - agent federation token
//! - `CLAUDE_RELAY_WEBHOOK_SECRET` - GitHub webhook HMAC secret
//!
//! A missing config file yields defaults; tokens must then come from the
//! environment or hub startup fails.

pub mod schema;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen port for the hub.
pub const DEFAULT_PORT: u16 = 8443;
/// Default upload cap: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
/// Default PTY geometry.
pub const DEFAULT_PTY_COLS: u16 = 120;
pub const DEFAULT_PTY_ROWS: u16 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("auth token not configured (set authToken in config or CLAUDE_RELAY_TOKEN)")]
    MissingAuthToken,
    #[error("agent token not configured (set agentToken in config or CLAUDE_RELAY_AGENT_TOKEN)")]
    MissingAgentToken,
}

/// PTY geometry used when spawning launchers and on initial attach.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyGeometry {
    fn default() -> Self {
        Self {
            cols: DEFAULT_PTY_COLS,
            rows: DEFAULT_PTY_ROWS,
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Bearer token required on client endpoints.
    pub auth_token: Option<String>,
    /// Bearer token required on the agent endpoint.
    pub agent_token: Option<String>,
    /// Token clients present to an agent's P2P listener. Falls back to
    /// `agent_token` when unset.
    pub agent_client_token: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// PEM private key path. Auto-generated self-signed material is used
    /// when unset.
    pub tls_key_path: Option<PathBuf>,
    /// PEM certificate path.
    pub tls_cert_path: Option<PathBuf>,
    /// Directory scanned for projects and used as the parent of
    /// newly created project directories.
    pub projects_dir: Option<PathBuf>,
    pub upload_enabled: Option<bool>,
    pub max_upload_bytes: Option<u64>,
    pub pty_geometry: Option<PtyGeometry>,
    /// Shared secret for `/webhook/github`. Verification is skipped when
    /// unset.
    pub webhook_secret: Option<String>,
    /// Command run when a verified webhook arrives (e.g. a repo pull).
    pub webhook_command: Option<String>,
    /// Optional reverse-proxy prefix, e.g. "/cnm".
    pub path_prefix: Option<String>,
    /// Directory of static client assets. The embedded fallback page is
    /// served when unset.
    pub static_dir: Option<PathBuf>,
    /// Accept self-signed hub certificates on outbound agent connections.
    pub trust_self_signed: Option<bool>,
}

impl Config {
    /// Load from the default (or overridden) path, then apply environment
    /// overrides. A missing file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load a config file from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("CLAUDE_RELAY_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        if let Ok(token) = std::env::var("CLAUDE_RELAY_AGENT_TOKEN") {
            if !token.is_empty() {
                self.agent_token = Some(token);
            }
        }
        if let Ok(secret) = std::env::var("CLAUDE_RELAY_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook_secret = Some(secret);
            }
        }
    }

    /// The client bearer token; required to run a hub or agent.
    pub fn require_auth_token(&self) -> Result<&str, ConfigError> {
        self.auth_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingAuthToken)
    }

    /// The agent federation token; required for `/agent` and P2P listeners.
    pub fn require_agent_token(&self) -> Result<&str, ConfigError> {
        self.agent_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingAgentToken)
    }

    /// Token validated on an agent's P2P client listener.
    pub fn agent_client_token(&self) -> Option<&str> {
        self.agent_client_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.agent_token.as_deref())
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn upload_enabled(&self) -> bool {
        self.upload_enabled.unwrap_or(true)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES)
    }

    pub fn pty_geometry(&self) -> PtyGeometry {
        self.pty_geometry.unwrap_or_default()
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.projects_dir
            .clone()
            .unwrap_or_else(|| state_dir().join("projects"))
    }

    /// Normalized path prefix: leading slash, no trailing slash, or `None`.
    pub fn path_prefix(&self) -> Option<String> {
        let raw = self.path_prefix.as_deref()?.trim();
        if raw.is_empty() || raw == "/" {
            return None;
        }
        let mut prefix = raw.trim_end_matches('/').to_string();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        Some(prefix)
    }
}

/// Root state directory: `CLAUDE_RELAY_STATE_DIR` or `~/.claude-relay`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAUDE_RELAY_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-relay")
}

/// Path of the config file: `CLAUDE_RELAY_CONFIG` or `<state>/config.json`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CLAUDE_RELAY_CONFIG") {
        return PathBuf::from(path);
    }
    state_dir().join("config.json")
}
