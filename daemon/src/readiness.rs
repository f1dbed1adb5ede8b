/// Pre-action gate: is the changed file unlocked and old enough to act on?
///
/// Each check is one attempt. Attempts below `lock_retries` are retried after a
/// short pause; attempts below `lock_retries_queue_limit` keep the action in the
/// queue on a longer timer; after that the action is given up.
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::FileProcessingSettings;

/// Why an action was dropped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    FileLockTestFailed,
    FileWasMissing,
    RenameFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Retry { delay: Duration },
    GiveUp(CancelReason),
}

/// File-system queries used by the checker. Split out so tests can fake a held lock.
pub trait FileProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    /// True when another handle prevents an exclusive open.
    fn is_locked(&self, path: &Path) -> bool;
    fn last_write(&self, path: &Path) -> Option<SystemTime>;
}

/// Probe backed by the real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileProbe;

impl FileProbe for OsFileProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_locked(&self, path: &Path) -> bool {
        match open_exclusive(path) {
            Ok(()) => false,
            Err(e) => e.kind() != io::ErrorKind::NotFound,
        }
    }

    fn last_write(&self, path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<()> {
    use std::os::windows::fs::OpenOptionsExt;
    // share_mode(0): fails while any other handle to the file is open.
    OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
        .map(|_| ())
}

#[cfg(not(windows))]
fn open_exclusive(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    match file.try_lock() {
        Ok(()) => {
            let _ = file.unlock();
            Ok(())
        }
        Err(std::fs::TryLockError::WouldBlock) => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "file is locked"))
        }
        Err(std::fs::TryLockError::Error(e)) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct FileReadinessChecker {
    must_exist: bool,
    lock_test: bool,
    lock_retries: u32,
    queue_limit: u32,
    retry_delay: Duration,
    queue_retry_delay: Duration,
    last_write_delay: Duration,
}

impl FileReadinessChecker {
    pub fn new(settings: &FileProcessingSettings) -> Self {
        Self {
            must_exist: settings.must_exist,
            lock_test: settings.lock_test,
            lock_retries: settings.lock_retries,
            queue_limit: settings.lock_retries_queue_limit.max(settings.lock_retries),
            retry_delay: Duration::from_millis(settings.lock_retry_delay_ms),
            queue_retry_delay: Duration::from_millis(settings.lock_queue_retry_delay_ms),
            last_write_delay: Duration::from_millis(settings.last_write_delay_ms),
        }
    }

    /// Whether the checker does any file-system work at all.
    pub fn is_active(&self) -> bool {
        self.must_exist || self.lock_test
    }

    /// Checks `path` for the `attempt`-th time (1-based).
    pub fn check(&self, probe: &dyn FileProbe, path: &Path, attempt: u32) -> Readiness {
        let exists = probe.exists(path);
        if !exists {
            return if self.must_exist {
                Readiness::GiveUp(CancelReason::FileWasMissing)
            } else {
                Readiness::Ready
            };
        }

        if !self.lock_test {
            return Readiness::Ready;
        }

        let young = self.last_write_delay > Duration::ZERO
            && probe
                .last_write(path)
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age < self.last_write_delay);

        if !young && !probe.is_locked(path) {
            return Readiness::Ready;
        }

        if attempt >= self.queue_limit {
            Readiness::GiveUp(CancelReason::FileLockTestFailed)
        } else if attempt < self.lock_retries {
            Readiness::Retry {
                delay: self.retry_delay,
            }
        } else {
            Readiness::Retry {
                delay: self.queue_retry_delay,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A probe reporting an existing file that stays locked.
    #[derive(Default)]
    pub(crate) struct LockedProbe {
        pub(crate) checks: AtomicU32,
    }

    impl FileProbe for LockedProbe {
        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn is_locked(&self, _path: &Path) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn last_write(&self, _path: &Path) -> Option<SystemTime> {
            Some(SystemTime::UNIX_EPOCH)
        }
    }

    fn settings(retries: u32, queue_limit: u32) -> FileProcessingSettings {
        FileProcessingSettings {
            lock_test: true,
            lock_retries: retries,
            lock_retries_queue_limit: queue_limit,
            lock_retry_delay_ms: 10,
            lock_queue_retry_delay_ms: 100,
            ..FileProcessingSettings::default()
        }
    }

    #[test]
    fn lock_test_disabled_is_always_ready() {
        let checker = FileReadinessChecker::new(&FileProcessingSettings::default());
        let probe = LockedProbe::default();
        assert_eq!(checker.check(&probe, Path::new("/x"), 1), Readiness::Ready);
        assert!(!checker.is_active());
    }

    #[test]
    fn locked_file_retries_then_gives_up_at_queue_limit() {
        let checker = FileReadinessChecker::new(&settings(3, 10));
        let probe = LockedProbe::default();
        let path = Path::new("/x");

        assert_eq!(
            checker.check(&probe, path, 1),
            Readiness::Retry { delay: Duration::from_millis(10) }
        );
        assert_eq!(
            checker.check(&probe, path, 2),
            Readiness::Retry { delay: Duration::from_millis(10) }
        );
        for attempt in 3..10 {
            assert_eq!(
                checker.check(&probe, path, attempt),
                Readiness::Retry { delay: Duration::from_millis(100) }
            );
        }
        assert_eq!(
            checker.check(&probe, path, 10),
            Readiness::GiveUp(CancelReason::FileLockTestFailed)
        );
    }

    #[test]
    fn queue_limit_below_retries_uses_retries() {
        let checker = FileReadinessChecker::new(&settings(4, 2));
        let probe = LockedProbe::default();
        assert!(matches!(
            checker.check(&probe, Path::new("/x"), 3),
            Readiness::Retry { .. }
        ));
        assert_eq!(
            checker.check(&probe, Path::new("/x"), 4),
            Readiness::GiveUp(CancelReason::FileLockTestFailed)
        );
    }

    #[test]
    fn missing_file_gives_up_when_it_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(3, 10);
        s.must_exist = true;
        let checker = FileReadinessChecker::new(&s);
        assert_eq!(
            checker.check(&OsFileProbe, &dir.path().join("gone.txt"), 1),
            Readiness::GiveUp(CancelReason::FileWasMissing)
        );
    }

    #[test]
    fn missing_file_is_tolerated_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        let checker = FileReadinessChecker::new(&settings(3, 10));
        assert_eq!(
            checker.check(&OsFileProbe, &dir.path().join("gone.txt"), 1),
            Readiness::Ready
        );
    }

    #[test]
    fn unlocked_file_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"data").unwrap();
        let checker = FileReadinessChecker::new(&settings(3, 10));
        assert_eq!(checker.check(&OsFileProbe, &path, 1), Readiness::Ready);
    }

    #[test]
    fn recently_written_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"data").unwrap();
        let mut s = settings(3, 10);
        s.last_write_delay_ms = 60_000;
        let checker = FileReadinessChecker::new(&s);
        assert!(matches!(
            checker.check(&OsFileProbe, &path, 1),
            Readiness::Retry { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn file_locked_by_another_handle_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"data").unwrap();
        let holder = std::fs::File::open(&path).unwrap();
        holder.lock().unwrap();
        assert!(OsFileProbe.is_locked(&path));
        holder.unlock().unwrap();
        assert!(!OsFileProbe.is_locked(&path));
    }
}
