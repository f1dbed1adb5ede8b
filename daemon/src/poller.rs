/// Directory scans: the startup search and the poll-directory fallback.
///
/// Both walk the watch root with `walkdir` (one level deep unless the daemon
/// includes subdirectories) and keep only files the daemon's selector matches.
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::change::ChangeSelector;
use crate::event::DaemonEventKind;
use crate::watch::RawNotification;

/// Startup search reports progress after this many matches.
const PROGRESS_EVERY: usize = 100;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

pub type Snapshot = HashMap<PathBuf, FileStamp>;

fn walker(selector: &ChangeSelector) -> WalkDir {
    let depth = if selector.include_subdirectories() { usize::MAX } else { 1 };
    WalkDir::new(selector.root()).min_depth(1).max_depth(depth)
}

/// Lists every matching file under the root. Blocking.
///
/// Walk errors and progress are handed to `report` as search events.
pub fn search(selector: &ChangeSelector, mut report: impl FnMut(DaemonEventKind)) -> Vec<PathBuf> {
    let mut scanned = 0;
    let mut matched = Vec::new();

    for entry in walker(selector) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report(DaemonEventKind::FileWatcherSearchError {
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        scanned += 1;
        if selector.matches_path(entry.path()) {
            matched.push(entry.into_path());
            if matched.len() % PROGRESS_EVERY == 0 {
                report(DaemonEventKind::FileWatcherSearchProgress {
                    scanned,
                    matched: matched.len(),
                });
            }
        }
    }

    report(DaemonEventKind::FileWatcherSearchProgress {
        scanned,
        matched: matched.len(),
    });
    matched
}

/// Size and modification time of every matching file. Blocking.
pub fn snapshot(selector: &ChangeSelector) -> Snapshot {
    let mut files = Snapshot::new();
    for entry in walker(selector) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Poll scan skipped an entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !selector.matches_path(entry.path()) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        files.insert(
            entry.into_path(),
            FileStamp {
                modified: meta.modified().ok(),
                len: meta.len(),
            },
        );
    }
    files
}

/// New files become `Created`, files whose size or mtime moved become `Changed`.
/// Disappearing files are left to the watch primitive.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Vec<RawNotification> {
    let mut out: Vec<RawNotification> = after
        .iter()
        .filter_map(|(path, stamp)| match before.get(path) {
            None => Some(RawNotification::Created(path.clone())),
            Some(old) if old != stamp => Some(RawNotification::Changed(path.clone())),
            Some(_) => None,
        })
        .collect();
    out.sort_by(|a, b| notification_path(a).cmp(&notification_path(b)));
    out
}

fn notification_path(n: &RawNotification) -> Option<&PathBuf> {
    match n {
        RawNotification::Created(p) | RawNotification::Changed(p) => Some(p),
        _ => None,
    }
}

async fn snapshot_off_thread(selector: &ChangeSelector) -> Option<Snapshot> {
    let selector = selector.clone();
    match spawn_blocking(move || snapshot(&selector)).await {
        Ok(snap) => Some(snap),
        Err(e) => {
            warn!("Poll scan failed: {e}");
            None
        }
    }
}

/// Rescans the root every `every` and sends what changed since the previous scan.
/// Returns when the receiver is gone; the supervisor aborts it on stop.
pub async fn run(selector: ChangeSelector, every: Duration, tx: mpsc::UnboundedSender<RawNotification>) {
    let mut known = snapshot_off_thread(&selector).await.unwrap_or_default();
    let mut ticker = interval(every.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(current) = snapshot_off_thread(&selector).await else {
            continue;
        };
        for n in diff(&known, &current) {
            if tx.send(n).is_err() {
                return;
            }
        }
        known = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    fn selector(root: &std::path::Path, filter: &str, recursive: bool) -> ChangeSelector {
        let mut config = DaemonConfig::new("d1", root);
        config.filter = filter.to_string();
        config.include_subdirectories = recursive;
        ChangeSelector::new(&config).unwrap()
    }

    fn touch(path: &std::path::Path, body: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    // ── search ────────────────────────────────────────────────────────────────

    #[test]
    fn search_finds_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.txt"), b"1");
        touch(&dir.path().join("b.log"), b"1");
        touch(&dir.path().join("sub").join("c.txt"), b"1");

        let mut events = Vec::new();
        let mut found = search(&selector(dir.path(), "*.txt", false), |k| events.push(k));
        found.sort();
        assert_eq!(found, vec![dir.path().join("a.txt")]);
        assert!(matches!(
            events.last(),
            Some(DaemonEventKind::FileWatcherSearchProgress { scanned: 2, matched: 1 })
        ));
    }

    #[test]
    fn search_descends_when_subdirectories_included() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.txt"), b"1");
        touch(&dir.path().join("sub").join("deeper").join("c.txt"), b"1");

        let mut found = search(&selector(dir.path(), "*.txt", true), |_| {});
        found.sort();
        assert_eq!(
            found,
            vec![
                dir.path().join("a.txt"),
                dir.path().join("sub").join("deeper").join("c.txt"),
            ]
        );
    }

    #[test]
    fn search_of_missing_root_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut errors = 0;
        let found = search(&selector(&dir.path().join("gone"), "*", false), |k| {
            if matches!(k, DaemonEventKind::FileWatcherSearchError { .. }) {
                errors += 1;
            }
        });
        assert!(found.is_empty());
        assert_eq!(errors, 1);
    }

    // ── snapshot / diff ───────────────────────────────────────────────────────

    #[test]
    fn diff_reports_new_and_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let sel = selector(dir.path(), "*", false);
        touch(&dir.path().join("keep.txt"), b"1");
        touch(&dir.path().join("grow.txt"), b"1");
        touch(&dir.path().join("drop.txt"), b"1");
        let before = snapshot(&sel);

        touch(&dir.path().join("grow.txt"), b"12345");
        touch(&dir.path().join("new.txt"), b"1");
        std::fs::remove_file(dir.path().join("drop.txt")).unwrap();
        let after = snapshot(&sel);

        assert_eq!(
            diff(&before, &after),
            vec![
                RawNotification::Changed(dir.path().join("grow.txt")),
                RawNotification::Created(dir.path().join("new.txt")),
            ]
        );
    }

    #[test]
    fn identical_snapshots_have_no_diff() {
        let dir = tempfile::tempdir().unwrap();
        let sel = selector(dir.path(), "*", false);
        touch(&dir.path().join("a.txt"), b"1");
        assert!(diff(&snapshot(&sel), &snapshot(&sel)).is_empty());
    }

    // ── run ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn poll_loop_reports_file_created_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            selector(dir.path(), "*.txt", false),
            Duration::from_millis(100),
            tx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        touch(&dir.path().join("late.txt"), b"x");

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        task.abort();
        assert_eq!(
            got.ok().flatten(),
            Some(RawNotification::Created(dir.path().join("late.txt")))
        );
    }
}
