use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DaemonConfig, EventSubscription};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Changed,
    Created,
    Deleted,
    Renamed,
    /// Synthesized by the startup directory search.
    SystemGenerated,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Changed => "Changed",
            ChangeType::Created => "Created",
            ChangeType::Deleted => "Deleted",
            ChangeType::Renamed => "Renamed",
            ChangeType::SystemGenerated => "SystemGenerated",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single accepted-or-not file change for one daemon. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub daemon: String,
    pub change_type: ChangeType,
    /// Path relative to the watch root.
    pub name: String,
    pub full_path: PathBuf,
    /// Previous location, only for `Renamed`.
    pub old_full_path: Option<PathBuf>,
    pub timestamp: DateTime<Local>,
    pub checksum: Option<String>,
}

impl ChangeEvent {
    pub fn new(
        daemon: &str,
        root: &Path,
        change_type: ChangeType,
        full_path: PathBuf,
        old_full_path: Option<PathBuf>,
    ) -> Self {
        let name = relative_name(root, &full_path);
        Self {
            id: Uuid::new_v4(),
            daemon: daemon.to_string(),
            change_type,
            name,
            full_path,
            old_full_path: if change_type == ChangeType::Renamed {
                old_full_path
            } else {
                None
            },
            timestamp: Local::now(),
            checksum: None,
        }
    }

    /// The bare file name, without any directory component.
    pub fn file_name(&self) -> String {
        self.full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

fn relative_name(root: &Path, full_path: &Path) -> String {
    match full_path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
        _ => full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Glob on the file name component. `*`, `*.*` and the empty string match everything.
#[derive(Debug, Clone)]
pub struct FileNameFilter {
    matcher: Option<GlobMatcher>,
}

impl FileNameFilter {
    pub fn new(daemon: &str, pattern: &str) -> Result<Self, ConfigError> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" || pattern == "*.*" {
            return Ok(Self { matcher: None });
        }
        let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidGlob {
            daemon: daemon.to_string(),
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            matcher: Some(glob.compile_matcher()),
        })
    }

    pub fn is_match(&self, path: &Path) -> bool {
        match (&self.matcher, path.file_name()) {
            (None, _) => true,
            (Some(m), Some(name)) => m.is_match(name),
            (Some(_), None) => false,
        }
    }
}

/// Turns a raw path notification into a `ChangeEvent` when the daemon's file
/// name filter, directory scope and subscriptions all allow it.
#[derive(Debug, Clone)]
pub struct ChangeSelector {
    daemon: String,
    root: PathBuf,
    names: FileNameFilter,
    subscribe: EventSubscription,
    include_subdirectories: bool,
}

impl ChangeSelector {
    pub fn new(config: &DaemonConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            daemon: config.name.clone(),
            root: config.path.clone(),
            names: FileNameFilter::new(&config.name, &config.filter)?,
            subscribe: config.subscribe.clone(),
            include_subdirectories: config.include_subdirectories,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn include_subdirectories(&self) -> bool {
        self.include_subdirectories
    }

    /// True when `path` lies in scope and its file name passes the filter.
    pub fn matches_path(&self, path: &Path) -> bool {
        if !self.include_subdirectories && path.parent() != Some(self.root.as_path()) {
            return false;
        }
        self.names.is_match(path)
    }

    pub fn subscribed(&self, change_type: ChangeType) -> bool {
        match change_type {
            ChangeType::Changed => self.subscribe.changed,
            ChangeType::Created => self.subscribe.created,
            ChangeType::Deleted => self.subscribe.deleted,
            ChangeType::Renamed => self.subscribe.renamed,
            ChangeType::SystemGenerated => true,
        }
    }

    pub fn select(
        &self,
        change_type: ChangeType,
        full_path: PathBuf,
        old_full_path: Option<PathBuf>,
    ) -> Option<ChangeEvent> {
        if !self.subscribed(change_type) {
            return None;
        }
        let in_scope = self.matches_path(&full_path)
            || old_full_path.as_deref().is_some_and(|old| self.matches_path(old));
        if !in_scope {
            return None;
        }
        Some(ChangeEvent::new(
            &self.daemon,
            &self.root,
            change_type,
            full_path,
            old_full_path,
        ))
    }
}
