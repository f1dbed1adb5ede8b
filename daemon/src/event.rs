use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::change::ChangeEvent;
use crate::config::LogSettings;
use crate::launcher::OutputStream;
use crate::readiness::CancelReason;
use crate::service::ServiceFailure;

/// Why a daemon's watcher was torn down and rebuilt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecycleReason {
    PathNotFound,
    WatcherError(String),
    /// The periodic `recycle_interval_ms` timer fired.
    Interval,
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecycleReason::PathNotFound => f.write_str("watch path not found"),
            RecycleReason::WatcherError(msg) => write!(f, "watcher error: {msg}"),
            RecycleReason::Interval => f.write_str("recycle interval elapsed"),
        }
    }
}

/// Something an observer (UI, log, status file) may want to know about.
#[derive(Debug, Clone)]
pub struct DaemonEvent {
    pub daemon: String,
    pub at: DateTime<Local>,
    pub kind: DaemonEventKind,
}

#[derive(Debug, Clone)]
pub enum DaemonEventKind {
    /// The configuration was rejected; the daemon did not start.
    ConfigurationError { message: String },
    FileWatcherStarting,
    FileWatcherStarted,
    FileWatcherStopped,
    FileWatcherRecycled { reason: RecycleReason },
    FileWatcherPathError { path: PathBuf, message: String },
    FileWatcherSearchProgress { scanned: usize, matched: usize },
    FileWatcherSearchError { message: String },
    /// The OS dropped notifications; already lost changes are not recoverable.
    FileWatcherBufferError,
    /// A change passed every filter and was handed to the dispatcher.
    ChangeAccepted(ChangeEvent),
    ProcessStarted {
        action_id: Uuid,
        pid: Option<u32>,
        file_name: String,
        arguments: String,
    },
    ProcessExited {
        action_id: Uuid,
        exit_code: Option<i32>,
        duration: Duration,
        /// Delivered after a synchronized wait was abandoned.
        late: bool,
    },
    ProcessCanceled {
        action_id: Uuid,
        path: PathBuf,
        reason: CancelReason,
    },
    ProcessData {
        action_id: Uuid,
        stream: OutputStream,
        line: String,
    },
    ProcessError { action_id: Uuid, message: String },
    ServiceBeginCall { action_id: Uuid },
    ServiceCalled { action_id: Uuid, response: String },
    ServiceError { action_id: Uuid, failure: ServiceFailure },
    ServiceProxyCreationError { action_id: Uuid, message: String },
}

impl DaemonEventKind {
    /// A one-line description when the event reports a failure.
    pub fn error_message(&self) -> Option<String> {
        match self {
            DaemonEventKind::ConfigurationError { message } => Some(message.clone()),
            DaemonEventKind::FileWatcherPathError { path, message } => {
                Some(format!("{}: {message}", path.display()))
            }
            DaemonEventKind::FileWatcherSearchError { message } => Some(message.clone()),
            DaemonEventKind::FileWatcherBufferError => Some("watcher buffer overflow".to_string()),
            DaemonEventKind::ProcessCanceled { path, reason, .. } => {
                Some(format!("{reason:?}: {}", path.display()))
            }
            DaemonEventKind::ProcessError { message, .. } => Some(message.clone()),
            DaemonEventKind::ServiceError { failure, .. } => Some(failure.to_string()),
            DaemonEventKind::ServiceProxyCreationError { message, .. } => Some(message.clone()),
            _ => None,
        }
    }
}

/// Publishes events to the observer without ever waiting on it.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DaemonEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        Self { tx }
    }

    /// Convenience constructor returning the observer's end as well.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DaemonEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn for_daemon(&self, daemon: &str, log: LogSettings) -> DaemonSink {
        DaemonSink {
            daemon: Arc::from(daemon),
            log: Arc::new(log),
            stats: Arc::default(),
            tx: self.tx.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ErrorStats {
    count: AtomicU64,
    last: Mutex<Option<String>>,
}

/// An [`EventSink`] bound to one daemon and its logging toggles.
/// Clones share one error tally.
#[derive(Debug, Clone)]
pub struct DaemonSink {
    daemon: Arc<str>,
    log: Arc<LogSettings>,
    stats: Arc<ErrorStats>,
    tx: mpsc::UnboundedSender<DaemonEvent>,
}

impl DaemonSink {
    pub fn daemon(&self) -> &str {
        &self.daemon
    }

    /// Same daemon and error tally, new logging toggles.
    pub fn with_log(&self, log: LogSettings) -> DaemonSink {
        DaemonSink {
            log: Arc::new(log),
            ..self.clone()
        }
    }

    pub fn error_count(&self) -> u64 {
        self.stats.count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.stats
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn emit(&self, kind: DaemonEventKind) {
        if let Some(message) = kind.error_message() {
            self.stats.count.fetch_add(1, Ordering::Relaxed);
            *self.stats.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
        }
        self.log_event(&kind);
        // A closed observer is not an error for the daemon.
        let _ = self.tx.send(DaemonEvent {
            daemon: self.daemon.to_string(),
            at: Local::now(),
            kind,
        });
    }

    fn log_event(&self, kind: &DaemonEventKind) {
        let daemon = &*self.daemon;
        let log = &*self.log;
        match kind {
            DaemonEventKind::ConfigurationError { message } => {
                warn!(daemon, "Configuration error: {message}")
            }
            DaemonEventKind::FileWatcherStarting if log.watcher_events => {
                debug!(daemon, "Watcher starting")
            }
            DaemonEventKind::FileWatcherStarted if log.watcher_events => {
                info!(daemon, "Watcher started")
            }
            DaemonEventKind::FileWatcherStopped if log.watcher_events => {
                info!(daemon, "Watcher stopped")
            }
            DaemonEventKind::FileWatcherRecycled { reason } if log.watcher_events => {
                info!(daemon, "Watcher recycled: {reason}")
            }
            DaemonEventKind::FileWatcherPathError { path, message } => {
                warn!(daemon, path = %path.display(), "Watch path error: {message}")
            }
            DaemonEventKind::FileWatcherBufferError => {
                warn!(daemon, "Watcher buffer overflow, notifications were lost")
            }
            DaemonEventKind::FileWatcherSearchProgress { scanned, matched } if log.search_events => {
                debug!(daemon, "Startup search: {matched}/{scanned} files matched")
            }
            DaemonEventKind::FileWatcherSearchError { message } if log.search_events => {
                warn!(daemon, "Startup search error: {message}")
            }
            DaemonEventKind::ChangeAccepted(change) if log.change_events => info!(
                daemon,
                "{} {}",
                change.change_type,
                change.full_path.display()
            ),
            DaemonEventKind::ProcessStarted { pid, file_name, arguments, .. }
                if log.process_events =>
            {
                info!(daemon, pid = ?pid, "Process started: {file_name} {arguments}")
            }
            DaemonEventKind::ProcessExited { exit_code, duration, late, .. }
                if log.process_events =>
            {
                info!(
                    daemon,
                    exit_code = ?exit_code,
                    late,
                    "Process exited after {:.1}s",
                    duration.as_secs_f64()
                )
            }
            DaemonEventKind::ProcessCanceled { path, reason, .. } if log.process_events => {
                warn!(daemon, path = %path.display(), "Process canceled: {reason:?}")
            }
            DaemonEventKind::ProcessData { stream, line, .. } if log.process_output => {
                info!(daemon, stream = ?stream, "{line}")
            }
            DaemonEventKind::ProcessError { message, .. } => {
                warn!(daemon, "Process error: {message}")
            }
            DaemonEventKind::ServiceBeginCall { .. } if log.service_events => {
                debug!(daemon, "Calling remote service")
            }
            DaemonEventKind::ServiceCalled { response, .. } if log.service_events => {
                info!(daemon, "Service responded: {response}")
            }
            DaemonEventKind::ServiceError { failure, .. } => {
                warn!(daemon, "Service error: {failure}")
            }
            DaemonEventKind::ServiceProxyCreationError { message, .. } => {
                warn!(daemon, "Service request could not be built: {message}")
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_tags_events_with_daemon_name() {
        let (sink, mut rx) = EventSink::channel();
        let d = sink.for_daemon("inbox", LogSettings::default());
        d.emit(DaemonEventKind::FileWatcherStarted);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.daemon, "inbox");
        assert!(matches!(event.kind, DaemonEventKind::FileWatcherStarted));
    }

    #[test]
    fn emit_after_observer_dropped_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.for_daemon("inbox", LogSettings::default())
            .emit(DaemonEventKind::FileWatcherBufferError);
    }

    #[test]
    fn disabled_log_category_still_reaches_observer() {
        let (sink, mut rx) = EventSink::channel();
        let log = LogSettings {
            watcher_events: false,
            ..LogSettings::default()
        };
        sink.for_daemon("inbox", log).emit(DaemonEventKind::FileWatcherStopped);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn error_events_are_tallied_across_clones() {
        let (sink, _rx) = EventSink::channel();
        let d = sink.for_daemon("inbox", LogSettings::default());
        let relogged = d.with_log(LogSettings {
            process_events: false,
            ..LogSettings::default()
        });
        d.emit(DaemonEventKind::FileWatcherStarted);
        d.emit(DaemonEventKind::FileWatcherBufferError);
        relogged.emit(DaemonEventKind::ProcessError {
            action_id: Uuid::new_v4(),
            message: "spawn failed".to_string(),
        });
        assert_eq!(d.error_count(), 2);
        assert_eq!(d.last_error().as_deref(), Some("spawn failed"));
    }

    #[test]
    fn recycle_reason_display() {
        assert_eq!(RecycleReason::Interval.to_string(), "recycle interval elapsed");
        assert_eq!(
            RecycleReason::WatcherError("boom".into()).to_string(),
            "watcher error: boom"
        );
    }
}
