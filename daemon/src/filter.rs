/// Per-daemon acceptance policy for change notifications.
///
/// Two stages, in order:
///   1. the change type's regular expression, matched against the file name;
///   2. filtered mode, which suppresses a repeated Changed/Created/Deleted for
///      the same path within the configured window.
///
/// The filter is owned by the daemon's supervisor task, so watch notifications
/// and poll results share one dedup window without extra locking.
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::change::{ChangeEvent, ChangeType};
use crate::config::DaemonConfig;
use crate::error::ConfigError;

/// Entries older than the window are dropped once the map grows past this.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
pub struct ChangeEventFilter {
    changed: Option<Regex>,
    created: Option<Regex>,
    deleted: Option<Regex>,
    renamed: Option<Regex>,
    filtered_mode: bool,
    window: Duration,
    last_seen: HashMap<(PathBuf, ChangeType), Instant>,
}

impl ChangeEventFilter {
    /// Compiles the daemon's expressions. A malformed one is a configuration error.
    pub fn new(config: &DaemonConfig) -> Result<Self, ConfigError> {
        let compile = |change_type: &'static str, pattern: &Option<String>| {
            match pattern.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(p) => Regex::new(p).map(Some).map_err(|e| ConfigError::InvalidRegex {
                    daemon: config.name.clone(),
                    change_type,
                    pattern: p.to_string(),
                    message: e.to_string(),
                }),
            }
        };
        Ok(Self {
            changed: compile("changed", &config.regex.changed)?,
            created: compile("created", &config.regex.created)?,
            deleted: compile("deleted", &config.regex.deleted)?,
            renamed: compile("renamed", &config.regex.renamed)?,
            filtered_mode: config.filtered_mode,
            window: Duration::from_millis(config.filtered_mode_timeout_ms),
            last_seen: HashMap::new(),
        })
    }

    pub fn accept(&mut self, event: &ChangeEvent) -> bool {
        self.accept_at(event, Instant::now())
    }

    /// Same as [`accept`](Self::accept) with an explicit clock reading.
    pub fn accept_at(&mut self, event: &ChangeEvent, now: Instant) -> bool {
        if let Some(re) = self.pattern_for(event.change_type) {
            if !re.is_match(&event.file_name()) {
                return false;
            }
        }

        if !self.filtered_mode || !is_deduplicated(event.change_type) {
            return true;
        }

        let key = (event.full_path.clone(), event.change_type);
        if let Some(seen) = self.last_seen.get(&key) {
            if now.saturating_duration_since(*seen) < self.window {
                return false;
            }
        }
        self.last_seen.insert(key, now);

        if self.last_seen.len() > PRUNE_THRESHOLD {
            let window = self.window;
            self.last_seen
                .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        }
        true
    }

    /// Forgets the dedup window, e.g. when the watcher is rebuilt.
    pub fn reset(&mut self) {
        self.last_seen.clear();
    }

    fn pattern_for(&self, change_type: ChangeType) -> Option<&Regex> {
        match change_type {
            ChangeType::Changed => self.changed.as_ref(),
            ChangeType::Created => self.created.as_ref(),
            ChangeType::Deleted => self.deleted.as_ref(),
            ChangeType::Renamed => self.renamed.as_ref(),
            ChangeType::SystemGenerated => None,
        }
    }
}

fn is_deduplicated(change_type: ChangeType) -> bool {
    matches!(
        change_type,
        ChangeType::Changed | ChangeType::Created | ChangeType::Deleted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn event(change_type: ChangeType, file: &str) -> ChangeEvent {
        ChangeEvent::new(
            "d1",
            Path::new("/watch"),
            change_type,
            Path::new("/watch").join(file),
            None,
        )
    }

    fn filtered(timeout_ms: u64) -> ChangeEventFilter {
        let mut cfg = DaemonConfig::new("d1", "/watch");
        cfg.filtered_mode = true;
        cfg.filtered_mode_timeout_ms = timeout_ms;
        ChangeEventFilter::new(&cfg).unwrap()
    }

    // ── regular expressions ───────────────────────────────────────────────────

    #[test]
    fn regex_rejects_non_matching_name() {
        let mut cfg = DaemonConfig::new("d1", "/watch");
        cfg.regex.created = Some(r"^in_\d+\.txt$".to_string());
        let mut f = ChangeEventFilter::new(&cfg).unwrap();
        assert!(f.accept(&event(ChangeType::Created, "in_42.txt")));
        assert!(!f.accept(&event(ChangeType::Created, "out_42.txt")));
        // Only the created expression is configured.
        assert!(f.accept(&event(ChangeType::Changed, "out_42.txt")));
    }

    #[test]
    fn blank_regex_is_ignored() {
        let mut cfg = DaemonConfig::new("d1", "/watch");
        cfg.regex.deleted = Some("   ".to_string());
        let mut f = ChangeEventFilter::new(&cfg).unwrap();
        assert!(f.accept(&event(ChangeType::Deleted, "anything")));
    }

    #[test]
    fn malformed_regex_is_a_config_error() {
        let mut cfg = DaemonConfig::new("d1", "/watch");
        cfg.regex.renamed = Some("(".to_string());
        let err = ChangeEventFilter::new(&cfg).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidRegex { change_type: "renamed", .. }
        ));
    }

    // ── filtered mode ─────────────────────────────────────────────────────────

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let mut f = filtered(1_000);
        let t0 = Instant::now();
        let e = event(ChangeType::Changed, "a.txt");
        assert!(f.accept_at(&e, t0));
        assert!(!f.accept_at(&e, t0 + Duration::from_millis(999)));
    }

    #[test]
    fn duplicate_after_window_is_accepted() {
        let mut f = filtered(1_000);
        let t0 = Instant::now();
        let e = event(ChangeType::Deleted, "a.txt");
        assert!(f.accept_at(&e, t0));
        assert!(f.accept_at(&e, t0 + Duration::from_millis(1_000)));
    }

    #[test]
    fn suppressed_event_does_not_extend_window() {
        let mut f = filtered(1_000);
        let t0 = Instant::now();
        let e = event(ChangeType::Changed, "a.txt");
        assert!(f.accept_at(&e, t0));
        assert!(!f.accept_at(&e, t0 + Duration::from_millis(800)));
        assert!(f.accept_at(&e, t0 + Duration::from_millis(1_200)));
    }

    #[test]
    fn renamed_and_system_generated_are_never_suppressed() {
        let mut f = filtered(60_000);
        let t0 = Instant::now();
        for change_type in [ChangeType::Renamed, ChangeType::SystemGenerated] {
            let e = event(change_type, "a.txt");
            for _ in 0..3 {
                assert!(f.accept_at(&e, t0));
            }
        }
    }

    #[test]
    fn created_then_two_changes_accepts_two() {
        let mut f = filtered(60_000);
        let t0 = Instant::now();
        let accepted = [
            (ChangeType::Created, 0),
            (ChangeType::Changed, 2_000),
            (ChangeType::Changed, 4_000),
        ]
        .into_iter()
        .filter(|(ct, ms)| f.accept_at(&event(*ct, "a.txt"), t0 + Duration::from_millis(*ms)))
        .count();
        assert_eq!(accepted, 2);
    }

    #[test]
    fn windows_are_independent_per_path() {
        let mut f = filtered(60_000);
        let t0 = Instant::now();
        assert!(f.accept_at(&event(ChangeType::Changed, "a.txt"), t0));
        assert!(f.accept_at(&event(ChangeType::Changed, "b.txt"), t0));
    }

    #[test]
    fn filtered_mode_off_accepts_everything() {
        let mut f = ChangeEventFilter::new(&DaemonConfig::new("d1", "/watch")).unwrap();
        let e = event(ChangeType::Changed, "a.txt");
        assert!(f.accept(&e));
        assert!(f.accept(&e));
    }

    #[test]
    fn reset_clears_window() {
        let mut f = filtered(60_000);
        let e = event(ChangeType::Created, "a.txt");
        assert!(f.accept(&e));
        f.reset();
        assert!(f.accept(&e));
    }
}
