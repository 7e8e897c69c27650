//! Session registry
//!
//! A directory of one JSON heartbeat record per live session, written only
//! by the owning launcher. Readers are tolerant: malformed files are
//! skipped, stale files (lastSeen older than 30 s) are unlinked
//! opportunistically during any scan. No locking; the single-writer rule
//! makes last-writer-wins safe.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::state_dir;
use crate::protocol::SessionState;
use crate::util::now_ms;

/// Readers treat records older than this as dead.
pub const STALE_AFTER_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to create registry directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write session record {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One live session's heartbeat record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Opaque stable id, unique within the registry. Also determines the
    /// local endpoint path via [`pipe_path`].
    pub id: String,
    /// Absolute working directory of the PTY child.
    pub cwd: PathBuf,
    /// Process id of the launcher (not the child).
    pub pid: u32,
    /// Local endpoint address derived from `id`.
    pub pipe: PathBuf,
    /// Epoch ms at first publish.
    pub started: u64,
    /// Epoch ms, refreshed at the heartbeat cadence.
    pub last_seen: u64,
    /// Number of currently attached channel peers.
    pub client_count: u32,
    /// Last ANSI-stripped output, at most 2 KB / 8 lines.
    pub preview: String,
    pub status: SessionState,
}

impl SessionRecord {
    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > STALE_AFTER_MS
    }
}

/// Directory holding the per-session records.
pub fn sessions_dir() -> PathBuf {
    state_dir().join("sessions")
}

/// Deterministic local endpoint path for a session id.
///
/// `CLAUDE_RELAY_PIPE_DIR` overrides the parent directory; the default is
/// the system temp dir (Unix socket paths have a low length ceiling, so
/// the state dir is not used here).
pub fn pipe_path(id: &str) -> PathBuf {
    let dir = std::env::var("CLAUDE_RELAY_PIPE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    dir.join(format!("claude-relay-{}.sock", id))
}

/// Filesystem-backed registry handle.
///
/// Cheap to construct; every operation re-reads the directory so callers
/// always observe current state.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(sessions_dir())
    }
}

impl SessionRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write the full record atomically (temp + rename).
    pub fn publish(&self, record: &SessionRecord) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RegistryError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.record_path(&record.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.id));
        let body = serde_json::to_vec(record)?;
        std::fs::write(&tmp, body).map_err(|source| RegistryError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| RegistryError::Write { path, source })?;
        Ok(())
    }

    /// Remove a session's record. Missing files are not an error.
    pub fn remove(&self, id: &str) {
        let path = self.record_path(id);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %id, error = %err, "failed to unlink session record");
            }
        }
    }

    /// Look up a single live record. Stale records are reaped and reported
    /// as absent.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let record = read_record(&self.record_path(id))?;
        if record.is_stale(now_ms()) {
            debug!(session_id = %id, "reaping stale session record");
            self.remove(id);
            return None;
        }
        Some(record)
    }

    /// Scan the registry: returns live records, unlinks stale ones,
    /// silently skips files that do not parse.
    pub fn scan(&self) -> Vec<SessionRecord> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let now = now_ms();
        let mut live = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(record) = read_record(&path) else {
                continue;
            };
            if record.is_stale(now) {
                debug!(session_id = %record.id, "reaping stale session record");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            live.push(record);
        }
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    /// Whether a live launcher currently owns `id`.
    pub fn is_live(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

fn read_record(path: &Path) -> Option<SessionRecord> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
