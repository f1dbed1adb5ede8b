use std::path::PathBuf;

use thiserror::Error;

/// A daemon configuration that cannot be started.
///
/// Reported once, when the daemon is added or started, never per event.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("daemon name must not be empty")]
    EmptyName,
    #[error("daemon '{0}' has no watch path")]
    EmptyPath(String),
    #[error("daemon '{0}' is already configured")]
    DuplicateName(String),
    #[error("daemon '{daemon}': invalid {change_type} filter '{pattern}': {message}")]
    InvalidRegex {
        daemon: String,
        change_type: &'static str,
        pattern: String,
        message: String,
    },
    #[error("daemon '{daemon}': invalid file name filter '{pattern}': {message}")]
    InvalidGlob {
        daemon: String,
        pattern: String,
        message: String,
    },
}

/// Failures raised by the file-system watch primitive.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch path not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("watcher backend error: {0}")]
    Backend(String),
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::PathNotFound => {
                WatchError::PathNotFound(err.paths.first().cloned().unwrap_or_default())
            }
            _ => WatchError::Backend(err.to_string()),
        }
    }
}

/// A process could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no process file name configured")]
    MissingFileName,
    #[error("failed to start '{file_name}': {source}")]
    Spawn {
        file_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown daemon '{0}'")]
    UnknownDaemon(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("daemon '{daemon}' failed to start: {source}")]
    Start {
        daemon: String,
        #[source]
        source: WatchError,
    },
}
