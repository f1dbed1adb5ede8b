/// Rename-in-place probe: a file still open for writing cannot be moved on
/// most platforms, so a successful temp-then-back rename proves the writer is done.
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::config::RenameSettings;

const TEMP_SUFFIX: &str = ".dirwatch-tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed(PathBuf),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct FileRenamer {
    retries: u32,
    pause: Duration,
}

impl FileRenamer {
    pub fn new(settings: &RenameSettings) -> Self {
        Self {
            retries: settings.retries.max(1),
            pause: Duration::from_millis(settings.retry_delay_ms),
        }
    }

    /// Blocking: sleeps between attempts. Run it off the async runtime.
    pub fn try_rename(&self, path: &Path) -> RenameOutcome {
        for attempt in 1..=self.retries {
            match rename_round_trip(path) {
                Ok(()) => return RenameOutcome::Renamed(path.to_path_buf()),
                Err(e) => {
                    debug!(
                        "Rename attempt {attempt}/{} failed for {}: {e}",
                        self.retries,
                        path.display()
                    );
                    if attempt < self.retries {
                        std::thread::sleep(self.pause);
                    }
                }
            }
        }
        RenameOutcome::GiveUp
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn rename_round_trip(path: &Path) -> io::Result<()> {
    let temp = temp_path(path);
    if temp.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", temp.display()),
        ));
    }
    std::fs::rename(path, &temp)?;
    if let Err(e) = std::fs::rename(&temp, path) {
        // Leave the file where it was found if the way back is blocked.
        let _ = std::fs::rename(&temp, path);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renamer(retries: u32) -> FileRenamer {
        FileRenamer::new(&RenameSettings {
            enabled: true,
            retries,
            retry_delay_ms: 1,
        })
    }

    #[test]
    fn rename_keeps_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"payload").unwrap();

        assert_eq!(renamer(3).try_rename(&path), RenameOutcome::Renamed(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn missing_file_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert_eq!(renamer(2).try_rename(&path), RenameOutcome::GiveUp);
    }

    #[test]
    fn occupied_temp_name_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();
        std::fs::write(temp_path(&path), b"y").unwrap();
        assert_eq!(renamer(1).try_rename(&path), RenameOutcome::GiveUp);
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(renamer(0).try_rename(&path), RenameOutcome::Renamed(_)));
    }
}
