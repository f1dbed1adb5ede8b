use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::change::FileNameFilter;
use crate::error::ConfigError;
use crate::filter::ChangeEventFilter;

pub const DEFAULT_FILE_FILTER: &str = "*";
pub const DEFAULT_FILTERED_MODE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_RECYCLE_RETRY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_BATCH_SIZE: usize = 4;
pub const DEFAULT_LOCK_RETRIES: u32 = 5;
pub const DEFAULT_LOCK_RETRIES_QUEUE_LIMIT: u32 = 20;
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_LOCK_QUEUE_RETRY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_RENAME_RETRIES: u32 = 3;
pub const DEFAULT_RENAME_RETRY_DELAY_MS: u64 = 200;
pub const DEFAULT_FILE_NAME_ESCAPE: &str = "{FullPath}";
pub const DEFAULT_OLD_FILE_NAME_ESCAPE: &str = "{OldFullPath}";
pub const DEFAULT_CHANGE_TYPE_ESCAPE: &str = "{ChangeType}";

/// Root configuration structure. Deserialized from `<app dir>/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub daemons: Vec<DaemonConfig>,
}

/// Settings that apply to every daemon's action queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Overrides every daemon's `process.batch_size` when set.
    #[serde(default)]
    pub process_batch_size: Option<usize>,
    /// Overrides every daemon's `process.synchronized_execution` when set.
    #[serde(default)]
    pub synchronized_execution: Option<bool>,
    /// When stopping a daemon, wait for its running actions to exit.
    #[serde(default)]
    pub wait_for_running_on_stop: bool,
}

/// Which kinds of attribute change the OS watcher should report as `Changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyFilter {
    FileName,
    DirectoryName,
    Attributes,
    Size,
    LastWrite,
    LastAccess,
    CreationTime,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStyle {
    #[default]
    Normal,
    Hidden,
    Minimized,
    Maximized,
}

/// One independently configured watch-and-react unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unique, non-empty key of the daemon.
    pub name: String,
    /// Started by `Controller::start_all` when true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory to watch.
    #[serde(default)]
    pub path: PathBuf,
    /// Glob applied to the file name (e.g. `*.txt`). `*` or empty matches everything.
    #[serde(default = "default_file_filter")]
    pub filter: String,
    #[serde(default)]
    pub include_subdirectories: bool,
    #[serde(default = "default_notify_filters")]
    pub notify_filters: Vec<NotifyFilter>,
    /// Suppress repeated Changed/Created/Deleted events for the same path.
    #[serde(default)]
    pub filtered_mode: bool,
    #[serde(default = "default_filtered_mode_timeout")]
    pub filtered_mode_timeout_ms: u64,
    /// Synthesize a `SystemGenerated` event for every matching file at startup.
    #[serde(default)]
    pub generate_events_at_startup: bool,
    #[serde(default)]
    pub poll_directory: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Rebuild the watcher after a path or backend error instead of stopping.
    #[serde(default)]
    pub recycle_file_watcher: bool,
    /// Unconditional periodic recycle. 0 disables it.
    #[serde(default)]
    pub recycle_interval_ms: u64,
    #[serde(default = "default_recycle_retry_delay")]
    pub recycle_retry_delay_ms: u64,
    #[serde(default)]
    pub subscribe: EventSubscription,
    #[serde(default)]
    pub regex: RegexFilters,
    #[serde(default)]
    pub process: ProcessSettings,
    #[serde(default)]
    pub file_processing: FileProcessingSettings,
    #[serde(default)]
    pub rename: RenameSettings,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    #[serde(default = "default_true")]
    pub changed: bool,
    #[serde(default = "default_true")]
    pub created: bool,
    #[serde(default = "default_true")]
    pub deleted: bool,
    #[serde(default = "default_true")]
    pub renamed: bool,
}

impl Default for EventSubscription {
    fn default() -> Self {
        Self {
            changed: true,
            created: true,
            deleted: true,
            renamed: true,
        }
    }
}

/// Per change type regular expressions matched against the file name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegexFilters {
    #[serde(default)]
    pub changed: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub deleted: Option<String>,
    #[serde(default)]
    pub renamed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSettings {
    /// Launch `file_name` for every accepted change.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Argument template; escape tokens below are substituted per event.
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub use_file_name_as_argument: bool,
    #[serde(default = "default_file_name_escape")]
    pub file_name_escape: String,
    #[serde(default)]
    pub use_old_file_name_as_argument: bool,
    #[serde(default = "default_old_file_name_escape")]
    pub old_file_name_escape: String,
    #[serde(default)]
    pub use_change_type_as_argument: bool,
    #[serde(default = "default_change_type_escape")]
    pub change_type_escape: String,
    #[serde(default)]
    pub verb: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub use_shell_execute: bool,
    #[serde(default)]
    pub window_style: WindowStyle,
    #[serde(default)]
    pub create_no_window: bool,
    #[serde(default)]
    pub redirect_standard_output: bool,
    #[serde(default)]
    pub redirect_standard_error: bool,
    /// Run one action at a time and wait for each process to exit.
    #[serde(default)]
    pub synchronized_execution: bool,
    /// Upper bound on the synchronized wait. 0 waits indefinitely.
    #[serde(default)]
    pub max_wait_time_ms: u64,
    /// Maximum number of concurrently running actions.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub run_as: Option<RunAs>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            file_name: None,
            arguments: String::new(),
            use_file_name_as_argument: false,
            file_name_escape: DEFAULT_FILE_NAME_ESCAPE.to_string(),
            use_old_file_name_as_argument: false,
            old_file_name_escape: DEFAULT_OLD_FILE_NAME_ESCAPE.to_string(),
            use_change_type_as_argument: false,
            change_type_escape: DEFAULT_CHANGE_TYPE_ESCAPE.to_string(),
            verb: None,
            working_directory: None,
            use_shell_execute: false,
            window_style: WindowStyle::Normal,
            create_no_window: false,
            redirect_standard_output: false,
            redirect_standard_error: false,
            synchronized_execution: false,
            max_wait_time_ms: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            run_as: None,
        }
    }
}

/// Credentials for launching the process as another user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAs {
    pub user: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProcessingSettings {
    /// Cancel the action when the changed file no longer exists.
    #[serde(default)]
    pub must_exist: bool,
    /// Deferred-start offset applied before an action becomes eligible to run.
    #[serde(default)]
    pub process_delay_ms: u64,
    /// Require an exclusive open of the file before acting on it.
    #[serde(default)]
    pub lock_test: bool,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    /// Ceiling on total attempts; past `lock_retries` the action stays queued until this.
    #[serde(default = "default_lock_retries_queue_limit")]
    pub lock_retries_queue_limit: u32,
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_lock_queue_retry_delay")]
    pub lock_queue_retry_delay_ms: u64,
    /// Minimum age of the file's last write.
    #[serde(default)]
    pub last_write_delay_ms: u64,
}

impl Default for FileProcessingSettings {
    fn default() -> Self {
        Self {
            must_exist: false,
            process_delay_ms: 0,
            lock_test: false,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_retries_queue_limit: DEFAULT_LOCK_RETRIES_QUEUE_LIMIT,
            lock_retry_delay_ms: DEFAULT_LOCK_RETRY_DELAY_MS,
            lock_queue_retry_delay_ms: DEFAULT_LOCK_QUEUE_RETRY_DELAY_MS,
            last_write_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rename_retries")]
    pub retries: u32,
    #[serde(default = "default_rename_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for RenameSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            retries: DEFAULT_RENAME_RETRIES,
            retry_delay_ms: DEFAULT_RENAME_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub call_service: bool,
    /// Attach the file contents and their checksum to the remote call.
    #[serde(default)]
    pub stream_file: bool,
}

/// Which event categories are mirrored into the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_true")]
    pub watcher_events: bool,
    #[serde(default = "default_true")]
    pub change_events: bool,
    #[serde(default = "default_true")]
    pub process_events: bool,
    #[serde(default)]
    pub process_output: bool,
    #[serde(default = "default_true")]
    pub service_events: bool,
    #[serde(default = "default_true")]
    pub search_events: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            watcher_events: true,
            change_events: true,
            process_events: true,
            process_output: false,
            service_events: true,
            search_events: true,
        }
    }
}

impl DaemonConfig {
    /// A daemon watching `path` with every other setting at its default.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            path: path.into(),
            filter: DEFAULT_FILE_FILTER.to_string(),
            include_subdirectories: false,
            notify_filters: default_notify_filters(),
            filtered_mode: false,
            filtered_mode_timeout_ms: DEFAULT_FILTERED_MODE_TIMEOUT_MS,
            generate_events_at_startup: false,
            poll_directory: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            recycle_file_watcher: false,
            recycle_interval_ms: 0,
            recycle_retry_delay_ms: DEFAULT_RECYCLE_RETRY_DELAY_MS,
            subscribe: EventSubscription::default(),
            regex: RegexFilters::default(),
            process: ProcessSettings::default(),
            file_processing: FileProcessingSettings::default(),
            rename: RenameSettings::default(),
            service: ServiceSettings::default(),
            logging: LogSettings::default(),
        }
    }

    /// Checks the invariants that must hold before the daemon may run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath(self.name.clone()));
        }
        FileNameFilter::new(&self.name, &self.filter)?;
        ChangeEventFilter::new(self)?;
        Ok(())
    }
}

/// Validates every record and rejects duplicate names.
pub fn validate_set<'a>(daemons: impl IntoIterator<Item = &'a DaemonConfig>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for daemon in daemons {
        daemon.validate()?;
        if !seen.insert(daemon.name.as_str()) {
            return Err(ConfigError::DuplicateName(daemon.name.clone()));
        }
    }
    Ok(())
}

/// Loads and persists daemon records. The core never sees the storage format.
pub trait ConfigurationProvider {
    fn load_all(&self) -> Result<BTreeMap<String, DaemonConfig>>;
    fn save_all(&self, daemons: &BTreeMap<String, DaemonConfig>) -> Result<()>;
}

/// Stores the configuration as a TOML file.
#[derive(Debug, Clone)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigurationProvider for TomlConfigProvider {
    fn load_all(&self) -> Result<BTreeMap<String, DaemonConfig>> {
        let config = load_or_default(&self.path)?;
        validate_set(&config.daemons)
            .with_context(|| format!("Invalid daemon set in {}", self.path.display()))?;
        Ok(config
            .daemons
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect())
    }

    /// Rewrites the daemon list while keeping the `[global]` table already on disk.
    fn save_all(&self, daemons: &BTreeMap<String, DaemonConfig>) -> Result<()> {
        let global = load_or_default(&self.path)?.global;
        let config = Config {
            global,
            daemons: daemons.values().cloned().collect(),
        };
        save(&self.path, &config)
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Serializes `config` to TOML at `path`, creating the parent directory.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends the parsed result to `tx`.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<Config>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!("Failed to create config file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            warn!("Config path {} has no parent directory", path.display());
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!("Failed to watch config directory {}: {e}", watch_dir.display());
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    debug!("Config file changed, {} daemon(s)", config.daemons.len());
                    if tx.send(config).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_file_filter() -> String {
    DEFAULT_FILE_FILTER.to_string()
}

fn default_notify_filters() -> Vec<NotifyFilter> {
    vec![NotifyFilter::FileName, NotifyFilter::LastWrite, NotifyFilter::Size]
}

fn default_filtered_mode_timeout() -> u64 {
    DEFAULT_FILTERED_MODE_TIMEOUT_MS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_recycle_retry_delay() -> u64 {
    DEFAULT_RECYCLE_RETRY_DELAY_MS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_lock_retries() -> u32 {
    DEFAULT_LOCK_RETRIES
}

fn default_lock_retries_queue_limit() -> u32 {
    DEFAULT_LOCK_RETRIES_QUEUE_LIMIT
}

fn default_lock_retry_delay() -> u64 {
    DEFAULT_LOCK_RETRY_DELAY_MS
}

fn default_lock_queue_retry_delay() -> u64 {
    DEFAULT_LOCK_QUEUE_RETRY_DELAY_MS
}

fn default_rename_retries() -> u32 {
    DEFAULT_RENAME_RETRIES
}

fn default_rename_retry_delay() -> u64 {
    DEFAULT_RENAME_RETRY_DELAY_MS
}

fn default_file_name_escape() -> String {
    DEFAULT_FILE_NAME_ESCAPE.to_string()
}

fn default_old_file_name_escape() -> String {
    DEFAULT_OLD_FILE_NAME_ESCAPE.to_string()
}

fn default_change_type_escape() -> String {
    DEFAULT_CHANGE_TYPE_ESCAPE.to_string()
}
