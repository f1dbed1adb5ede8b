use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::change::ChangeType;

/// Lifecycle state of one daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// No watch is attached and nothing new is queued.
    #[default]
    Stopped,
    /// The startup search or the watch attach is in progress.
    Starting,
    /// The watch primitive is attached and events flow into the queue.
    Running,
    /// The watch was torn down and is being re-attached.
    Recycling,
}

/// Read-only snapshot of a daemon's runtime state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonStatus {
    pub name: String,
    pub state: DaemonState,
    pub enabled: bool,
    /// Accepted change events since the daemon was added.
    pub event_count: u64,
    /// Path, watcher, process and service errors since the daemon was added.
    pub error_count: u64,
    pub queued: usize,
    pub running: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<ChangeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DaemonStatus {
    pub fn new(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            state: DaemonState::Stopped,
            enabled,
            event_count: 0,
            error_count: 0,
            queued: 0,
            running: 0,
            last_event_type: None,
            last_event_time: None,
            last_error: None,
        }
    }
}

/// Runtime status written by the binary to `<app dir>/status.toml`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ControllerStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub running_watchers: usize,
    pub running_processes: usize,
    pub queued_processes: usize,
    #[serde(default)]
    pub daemons: Vec<DaemonStatus>,
}

impl ControllerStatus {
    pub fn new(daemons: Vec<DaemonStatus>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            running_watchers: daemons
                .iter()
                .filter(|d| d.state == DaemonState::Running)
                .count(),
            running_processes: daemons.iter().map(|d| d.running).sum(),
            queued_processes: daemons.iter().map(|d| d.queued).sum(),
            daemons,
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist. Failures are logged only.
pub fn write_status(path: &Path, status: &ControllerStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("Failed to write status file: {e}");
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}
