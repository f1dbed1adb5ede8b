/// File-system watch primitive.
///
/// `WatchPrimitive::attach` starts watching a directory and pushes
/// [`RawNotification`]s into the supervisor's channel until the returned handle
/// is detached. `NotifyWatchPrimitive` is the `notify` backed implementation.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{DaemonConfig, NotifyFilter};
use crate::error::WatchError;

/// A rename half whose partner has not shown up by then is reported as a delete.
const RENAME_PAIRING_WINDOW: Duration = Duration::from_millis(500);

/// An unfiltered notification from the watch backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNotification {
    Changed(PathBuf),
    Created(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    /// The backend dropped notifications.
    BufferOverflow,
    /// The watched directory itself is gone.
    PathNotFound(PathBuf),
    /// Any other backend failure. The watch may no longer be reliable.
    Error(String),
}

/// What to watch. The file name filter is applied downstream, backends may ignore it.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSpec {
    pub path: PathBuf,
    pub filter: String,
    pub notify_filters: Vec<NotifyFilter>,
    pub include_subdirectories: bool,
}

impl WatchSpec {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            path: config.path.clone(),
            filter: config.filter.clone(),
            notify_filters: config.notify_filters.clone(),
            include_subdirectories: config.include_subdirectories,
        }
    }
}

pub trait WatchPrimitive: Send + Sync {
    fn attach(
        &self,
        spec: &WatchSpec,
        tx: mpsc::UnboundedSender<RawNotification>,
    ) -> Result<Box<dyn WatchHandle>, WatchError>;
}

/// An attached watch. Dropping it also stops the watch.
pub trait WatchHandle: Send {
    fn detach(self: Box<Self>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyWatchPrimitive;

struct NotifyHandle {
    watcher: RecommendedWatcher,
    path: PathBuf,
}

impl WatchHandle for NotifyHandle {
    fn detach(mut self: Box<Self>) {
        if let Err(e) = self.watcher.unwatch(&self.path) {
            debug!("Unwatch of {} failed: {e}", self.path.display());
        }
    }
}

impl WatchPrimitive for NotifyWatchPrimitive {
    fn attach(
        &self,
        spec: &WatchSpec,
        tx: mpsc::UnboundedSender<RawNotification>,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        if !spec.path.is_dir() {
            return Err(WatchError::PathNotFound(spec.path.clone()));
        }

        let mut translator = NotifyTranslator::new(spec);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let notifications = match res {
                    Ok(event) => translator.translate(event, Instant::now()),
                    Err(e) => vec![translate_error(e)],
                };
                for n in notifications {
                    if tx.send(n).is_err() {
                        break;
                    }
                }
            },
            NotifyConfig::default(),
        )?;

        let mode = if spec.include_subdirectories {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&spec.path, mode)?;
        Ok(Box::new(NotifyHandle {
            watcher,
            path: spec.path.clone(),
        }))
    }
}

fn translate_error(err: notify::Error) -> RawNotification {
    match WatchError::from(err) {
        WatchError::PathNotFound(path) => RawNotification::PathNotFound(path),
        WatchError::Backend(msg) => RawNotification::Error(msg),
    }
}

struct PendingRename {
    tracker: Option<usize>,
    from: PathBuf,
    at: Instant,
}

/// Maps `notify` events onto [`RawNotification`]s for one watch root.
///
/// Backends report a rename as separate "from" and "to" halves, sometimes
/// followed by a combined event. Halves are paired by tracker id (or by order
/// when the backend has none); an unpaired "from" becomes a delete once it is
/// older than [`RENAME_PAIRING_WINDOW`], checked on the next event.
struct NotifyTranslator {
    root: PathBuf,
    filters: Vec<NotifyFilter>,
    pending: VecDeque<PendingRename>,
}

impl NotifyTranslator {
    fn new(spec: &WatchSpec) -> Self {
        Self {
            root: spec.path.clone(),
            filters: spec.notify_filters.clone(),
            pending: VecDeque::new(),
        }
    }

    fn wants(&self, any_of: &[NotifyFilter]) -> bool {
        self.filters.is_empty() || any_of.iter().any(|f| self.filters.contains(f))
    }

    /// File-name events are reported unless both name filters are off.
    fn wants_names(&self, folder: Option<bool>) -> bool {
        match folder {
            Some(true) => self.wants(&[NotifyFilter::DirectoryName]),
            Some(false) => self.wants(&[NotifyFilter::FileName]),
            None => self.wants(&[NotifyFilter::FileName, NotifyFilter::DirectoryName]),
        }
    }

    fn translate(&mut self, event: Event, now: Instant) -> Vec<RawNotification> {
        let mut out = self.expire(now);

        if event.need_rescan() {
            out.push(RawNotification::BufferOverflow);
            return out;
        }

        let tracker = event.attrs.tracker();
        let mut paths = event.paths.into_iter();
        match event.kind {
            EventKind::Create(kind) => {
                if self.wants_names(folder_of_create(kind)) {
                    out.extend(paths.map(RawNotification::Created));
                }
            }
            EventKind::Remove(kind) => {
                for path in paths {
                    if path == self.root {
                        out.push(RawNotification::PathNotFound(path));
                    } else if self.wants_names(folder_of_remove(kind)) {
                        out.push(RawNotification::Deleted(path));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => {
                if !self.wants_names(None) {
                    return out;
                }
                match mode {
                    RenameMode::From => {
                        if let Some(from) = paths.next() {
                            self.pending.push_back(PendingRename { tracker, from, at: now });
                        }
                    }
                    RenameMode::To => {
                        if let Some(to) = paths.next() {
                            match self.take_pending(tracker) {
                                Some(from) => out.push(RawNotification::Renamed { from, to }),
                                None => out.push(RawNotification::Created(to)),
                            }
                        }
                    }
                    RenameMode::Both => {
                        if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                            // With a tracker the "to" half has usually paired it already.
                            if self.take_pending_path(&from) || tracker.is_none() {
                                out.push(RawNotification::Renamed { from, to });
                            }
                        }
                    }
                    RenameMode::Any | RenameMode::Other => {
                        for path in paths {
                            if path.exists() {
                                out.push(RawNotification::Created(path));
                            } else if path == self.root {
                                out.push(RawNotification::PathNotFound(path));
                            } else {
                                out.push(RawNotification::Deleted(path));
                            }
                        }
                    }
                }
            }
            EventKind::Modify(kind) => {
                if self.wants(modify_filters(kind)) {
                    out.extend(
                        paths
                            .filter(|p| *p != self.root)
                            .map(RawNotification::Changed),
                    );
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
        out
    }

    fn take_pending(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
        let idx = match tracker {
            Some(t) => self.pending.iter().position(|p| p.tracker == Some(t))?,
            None => self.pending.iter().rposition(|p| p.tracker.is_none())?,
        };
        self.pending.remove(idx).map(|p| p.from)
    }

    fn take_pending_path(&mut self, from: &Path) -> bool {
        match self.pending.iter().position(|p| p.from == from) {
            Some(idx) => {
                self.pending.remove(idx);
                true
            }
            None => false,
        }
    }

    fn expire(&mut self, now: Instant) -> Vec<RawNotification> {
        let mut out = Vec::new();
        while let Some(front) = self.pending.front() {
            if now.duration_since(front.at) < RENAME_PAIRING_WINDOW {
                break;
            }
            if let Some(p) = self.pending.pop_front() {
                out.push(RawNotification::Deleted(p.from));
            }
        }
        out
    }
}

fn folder_of_create(kind: CreateKind) -> Option<bool> {
    match kind {
        CreateKind::File => Some(false),
        CreateKind::Folder => Some(true),
        _ => None,
    }
}

fn folder_of_remove(kind: RemoveKind) -> Option<bool> {
    match kind {
        RemoveKind::File => Some(false),
        RemoveKind::Folder => Some(true),
        _ => None,
    }
}

fn modify_filters(kind: ModifyKind) -> &'static [NotifyFilter] {
    use NotifyFilter::*;
    match kind {
        ModifyKind::Data(_) => &[Size, LastWrite],
        ModifyKind::Metadata(MetadataKind::AccessTime) => &[LastAccess],
        ModifyKind::Metadata(MetadataKind::WriteTime) => &[LastWrite],
        ModifyKind::Metadata(MetadataKind::Permissions | MetadataKind::Ownership) => &[Security],
        ModifyKind::Metadata(MetadataKind::Extended) => &[Attributes],
        ModifyKind::Metadata(_) => &[Attributes, LastWrite, CreationTime],
        _ => &[Size, LastWrite, Attributes],
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use notify::event::{DataChange, Flag};

    /// Watch double: tests push notifications into whichever watch is attached.
    #[derive(Clone, Default)]
    pub(crate) struct ManualWatch {
        current: Arc<Mutex<Option<mpsc::UnboundedSender<RawNotification>>>>,
        missing: Arc<Mutex<bool>>,
        pub(crate) attaches: Arc<AtomicUsize>,
        pub(crate) detaches: Arc<AtomicUsize>,
    }

    struct ManualHandle {
        current: Arc<Mutex<Option<mpsc::UnboundedSender<RawNotification>>>>,
        detaches: Arc<AtomicUsize>,
    }

    impl WatchHandle for ManualHandle {
        fn detach(self: Box<Self>) {
            *self.current.lock().unwrap() = None;
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ManualWatch {
        /// Returns false when no watch is attached.
        pub(crate) fn inject(&self, n: RawNotification) -> bool {
            match &*self.current.lock().unwrap() {
                Some(tx) => tx.send(n).is_ok(),
                None => false,
            }
        }

        /// While set, attaching fails with `PathNotFound`.
        pub(crate) fn set_missing(&self, missing: bool) {
            *self.missing.lock().unwrap() = missing;
        }

        pub(crate) fn is_attached(&self) -> bool {
            self.current.lock().unwrap().is_some()
        }
    }

    impl WatchPrimitive for ManualWatch {
        fn attach(
            &self,
            spec: &WatchSpec,
            tx: mpsc::UnboundedSender<RawNotification>,
        ) -> Result<Box<dyn WatchHandle>, WatchError> {
            if *self.missing.lock().unwrap() {
                return Err(WatchError::PathNotFound(spec.path.clone()));
            }
            self.attaches.fetch_add(1, Ordering::SeqCst);
            *self.current.lock().unwrap() = Some(tx);
            Ok(Box::new(ManualHandle {
                current: Arc::clone(&self.current),
                detaches: Arc::clone(&self.detaches),
            }))
        }
    }

    fn translator(filters: Vec<NotifyFilter>) -> NotifyTranslator {
        NotifyTranslator::new(&WatchSpec {
            path: PathBuf::from("/w"),
            filter: "*".to_string(),
            notify_filters: filters,
            include_subdirectories: false,
        })
    }

    fn default_translator() -> NotifyTranslator {
        translator(vec![NotifyFilter::FileName, NotifyFilter::LastWrite, NotifyFilter::Size])
    }

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    // ── event mapping ─────────────────────────────────────────────────────────

    #[test]
    fn create_and_remove_map_directly() {
        let mut t = default_translator();
        let now = Instant::now();
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(p("/w/a.txt"));
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(p("/w/a.txt"));
        assert_eq!(t.translate(created, now), vec![RawNotification::Created(p("/w/a.txt"))]);
        assert_eq!(t.translate(removed, now), vec![RawNotification::Deleted(p("/w/a.txt"))]);
    }

    #[test]
    fn removing_the_root_is_path_not_found() {
        let mut t = default_translator();
        let ev = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(p("/w"));
        assert_eq!(
            t.translate(ev, Instant::now()),
            vec![RawNotification::PathNotFound(p("/w"))]
        );
    }

    #[test]
    fn rescan_flag_is_buffer_overflow() {
        let mut t = default_translator();
        let ev = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(t.translate(ev, Instant::now()), vec![RawNotification::BufferOverflow]);
    }

    #[test]
    fn data_change_respects_notify_filters() {
        let ev = || {
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(p("/w/a"))
        };
        let now = Instant::now();
        assert_eq!(
            default_translator().translate(ev(), now),
            vec![RawNotification::Changed(p("/w/a"))]
        );
        assert!(translator(vec![NotifyFilter::Security]).translate(ev(), now).is_empty());
    }

    #[test]
    fn permission_change_needs_security_filter() {
        let ev = || {
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
                .add_path(p("/w/a"))
        };
        let now = Instant::now();
        assert!(default_translator().translate(ev(), now).is_empty());
        assert_eq!(
            translator(vec![NotifyFilter::Security]).translate(ev(), now),
            vec![RawNotification::Changed(p("/w/a"))]
        );
    }

    #[test]
    fn folder_events_need_directory_filter() {
        let ev = || Event::new(EventKind::Create(CreateKind::Folder)).add_path(p("/w/sub"));
        let now = Instant::now();
        assert!(default_translator().translate(ev(), now).is_empty());
        assert_eq!(
            translator(vec![NotifyFilter::DirectoryName]).translate(ev(), now),
            vec![RawNotification::Created(p("/w/sub"))]
        );
    }

    // ── rename pairing ────────────────────────────────────────────────────────

    #[test]
    fn tracked_halves_pair_into_one_rename() {
        let mut t = default_translator();
        let now = Instant::now();
        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(p("/w/old"))
            .set_tracker(7);
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(p("/w/new"))
            .set_tracker(7);
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(p("/w/old"))
            .add_path(p("/w/new"))
            .set_tracker(7);

        assert!(t.translate(from, now).is_empty());
        assert_eq!(
            t.translate(to, now),
            vec![RawNotification::Renamed { from: p("/w/old"), to: p("/w/new") }]
        );
        assert!(t.translate(both, now).is_empty());
    }

    #[test]
    fn untracked_both_is_a_rename() {
        let mut t = default_translator();
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(p("/w/old"))
            .add_path(p("/w/new"));
        assert_eq!(
            t.translate(both, Instant::now()),
            vec![RawNotification::Renamed { from: p("/w/old"), to: p("/w/new") }]
        );
    }

    #[test]
    fn lone_to_half_is_a_create() {
        let mut t = default_translator();
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(p("/w/moved-in"))
            .set_tracker(3);
        assert_eq!(
            t.translate(to, Instant::now()),
            vec![RawNotification::Created(p("/w/moved-in"))]
        );
    }

    #[test]
    fn unpaired_from_half_expires_into_delete() {
        let mut t = default_translator();
        let start = Instant::now();
        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(p("/w/moved-out"))
            .set_tracker(9);
        assert!(t.translate(from, start).is_empty());

        let later = Event::new(EventKind::Create(CreateKind::File)).add_path(p("/w/b"));
        assert_eq!(
            t.translate(later, start + RENAME_PAIRING_WINDOW),
            vec![
                RawNotification::Deleted(p("/w/moved-out")),
                RawNotification::Created(p("/w/b")),
            ]
        );
    }

    // ── NotifyWatchPrimitive ──────────────────────────────────────────────────

    #[test]
    fn attach_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = WatchSpec {
            path: dir.path().join("nope"),
            filter: "*".into(),
            notify_filters: Vec::new(),
            include_subdirectories: false,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            NotifyWatchPrimitive.attach(&spec, tx),
            Err(WatchError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn notify_backend_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let spec = WatchSpec {
            path: root.clone(),
            filter: "*".into(),
            notify_filters: vec![NotifyFilter::FileName],
            include_subdirectories: false,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NotifyWatchPrimitive.attach(&spec, tx).unwrap();

        let file = root.join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(n) = rx.recv().await {
                if n == RawNotification::Created(file.clone()) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        handle.detach();
        assert!(found);
    }
}
