use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::control::ConnectionState;
use crate::model::ProcessStatus;
use crate::reconcile::WatchSnapshot;

/// Runtime status written by the agent to `<app dir>/status.toml` for local
/// inspection. Nothing reads it back.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentStatus {
    /// Agent binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Subject the agent reports under.
    pub subject_id: String,
    pub connection: ConnectionState,
    pub watched_processes: usize,
    /// Watched processes whose last probe found them not running.
    pub watched_down: usize,
    /// RFC 3339 timestamp of the last successful desired-set seed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_timestamp: Option<String>,
    /// Most recent non-fatal error, cleared by the next successful seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentStatus {
    /// Constructs the initial status on startup.
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            subject_id: subject_id.into(),
            connection: ConnectionState::Disconnected,
            watched_processes: 0,
            watched_down: 0,
            last_refresh_timestamp: None,
            error: None,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: &WatchSnapshot) {
        self.watched_processes = snapshot.processes.len();
        self.watched_down = snapshot
            .processes
            .iter()
            .filter(|p| p.status == ProcessStatus::Down)
            .count();
        self.last_refresh_timestamp = snapshot.last_seed.map(|t| t.to_rfc3339());
        self.error = snapshot.last_error.clone();
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged, never returned: losing a status write is harmless.
pub fn write_status(path: &Path, status: &AgentStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(path = %path.display(), error = %e, "failed to write status file");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize status"),
    }
}
