/// Lifecycle of one daemon: `Stopped -> Starting -> Running -> (Stopped | Recycling -> Starting)`.
///
/// `DaemonSupervisor::start` runs the optional startup search, attaches the
/// watch primitive and spawns the daemon's worker task. The worker owns the
/// change filter and handles, one at a time, watch notifications, poll results,
/// the periodic recycle timer and recycle retries. Accepted changes go to the
/// dispatcher and from there into the daemon's action queue.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::action_queue::{ActionQueue, ActionRuntime, QueueLimits};
use crate::change::{ChangeSelector, ChangeType};
use crate::config::DaemonConfig;
use crate::dispatcher::ActionDispatcher;
use crate::error::{ConfigError, ControllerError};
use crate::event::{DaemonEventKind, DaemonSink, EventSink, RecycleReason};
use crate::filter::ChangeEventFilter;
use crate::poller;
use crate::status::{DaemonState, DaemonStatus};
use crate::watch::{RawNotification, WatchHandle, WatchPrimitive, WatchSpec};

/// Shared collaborators handed to every supervisor.
#[derive(Clone)]
pub struct Collaborators {
    pub watch: Arc<dyn WatchPrimitive>,
    pub runtime: Arc<ActionRuntime>,
    pub events: EventSink,
}

#[derive(Debug, Default)]
struct RuntimeState {
    state: DaemonState,
    event_count: u64,
    last_event_type: Option<ChangeType>,
    last_event_time: Option<DateTime<Local>>,
}

type SharedRuntime = Arc<Mutex<RuntimeState>>;

fn lock(runtime: &SharedRuntime) -> MutexGuard<'_, RuntimeState> {
    runtime.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WorkerTask {
    /// Setting this to `true` asks the worker to shut down.
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct DaemonSupervisor {
    config: DaemonConfig,
    watch: Arc<dyn WatchPrimitive>,
    sink: DaemonSink,
    queue: ActionQueue,
    runtime: SharedRuntime,
    task: Option<WorkerTask>,
}

impl DaemonSupervisor {
    pub fn new(config: DaemonConfig, limits: QueueLimits, collaborators: &Collaborators) -> Self {
        let sink = collaborators
            .events
            .for_daemon(&config.name, config.logging.clone());
        let queue = ActionQueue::new(
            &config,
            limits,
            Arc::clone(&collaborators.runtime),
            sink.clone(),
        );
        Self {
            config,
            watch: Arc::clone(&collaborators.watch),
            sink,
            queue,
            runtime: SharedRuntime::default(),
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn state(&self) -> DaemonState {
        lock(&self.runtime).state
    }

    /// True while the worker task is alive (Starting, Running or Recycling).
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    pub fn status(&self) -> DaemonStatus {
        let rt = lock(&self.runtime);
        DaemonStatus {
            name: self.config.name.clone(),
            state: rt.state,
            enabled: self.config.enabled,
            event_count: rt.event_count,
            error_count: self.sink.error_count(),
            queued: self.queue.queued_count(),
            running: self.queue.running_count(),
            last_event_type: rt.last_event_type,
            last_event_time: rt.last_event_time,
            last_error: self.sink.last_error(),
        }
    }

    /// Replaces the configuration of a stopped daemon. The queue and its
    /// running actions carry over.
    pub fn reconfigure(&mut self, config: DaemonConfig, limits: QueueLimits) {
        self.sink = self.sink.with_log(config.logging.clone());
        self.queue.reconfigure(&config, limits, self.sink.clone());
        self.config = config;
    }

    pub fn set_limits(&self, limits: QueueLimits) {
        self.queue.set_limits(limits);
    }

    pub async fn start(&mut self) -> Result<(), ControllerError> {
        if self.is_active() {
            return Ok(());
        }
        self.reap().await;

        let mut worker = match self.prepare() {
            Ok(worker) => worker,
            Err(e) => {
                self.sink.emit(DaemonEventKind::ConfigurationError {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        worker.set_state(DaemonState::Starting);
        self.sink.emit(DaemonEventKind::FileWatcherStarting);

        if self.config.generate_events_at_startup {
            worker.startup_search().await;
        }

        if let Err(e) = worker.attach() {
            worker.path_error(e.to_string());
            if !self.config.recycle_file_watcher {
                worker.set_state(DaemonState::Stopped);
                return Err(ControllerError::Start {
                    daemon: self.config.name.clone(),
                    source: e,
                });
            }
            worker.schedule_retry(RecycleReason::PathNotFound);
        } else {
            worker.set_state(DaemonState::Running);
            self.sink.emit(DaemonEventKind::FileWatcherStarted);
        }

        if self.config.poll_directory {
            worker.poller = Some(tokio::spawn(poller::run(
                worker.selector.clone(),
                Duration::from_millis(self.config.poll_interval_ms),
                worker.raw_tx.clone(),
            )));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(stop_rx));
        self.task = Some(WorkerTask { stop_tx, handle });
        Ok(())
    }

    /// Detaches the watch and drops every queued action that has not started.
    /// With `wait_for_running`, also waits for running actions to finish.
    pub async fn stop(&mut self, wait_for_running: bool) {
        self.reap().await;
        self.queue.cancel();
        if wait_for_running {
            self.queue.wait_running().await;
        }
    }

    async fn reap(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.stop_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!(daemon = %self.config.name, "Worker task ended abnormally: {e}");
            }
        }
    }

    fn prepare(&self) -> Result<Worker, ConfigError> {
        self.config.validate()?;
        let selector = ChangeSelector::new(&self.config)?;
        let filter = ChangeEventFilter::new(&self.config)?;
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Ok(Worker {
            spec: WatchSpec::from_config(&self.config),
            recycle_on_error: self.config.recycle_file_watcher,
            recycle_every: Duration::from_millis(self.config.recycle_interval_ms),
            retry_delay: Duration::from_millis(self.config.recycle_retry_delay_ms),
            selector,
            filter,
            dispatcher: ActionDispatcher::new(&self.config),
            queue: self.queue.clone(),
            sink: self.sink.clone(),
            runtime: Arc::clone(&self.runtime),
            watch: Arc::clone(&self.watch),
            raw_tx,
            raw_rx,
            handle: None,
            poller: None,
            retry: None,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// The daemon's single owner of its filter, watch handle and poll task.
struct Worker {
    spec: WatchSpec,
    recycle_on_error: bool,
    recycle_every: Duration,
    retry_delay: Duration,
    selector: ChangeSelector,
    filter: ChangeEventFilter,
    dispatcher: ActionDispatcher,
    queue: ActionQueue,
    sink: DaemonSink,
    runtime: SharedRuntime,
    watch: Arc<dyn WatchPrimitive>,
    raw_tx: mpsc::UnboundedSender<RawNotification>,
    raw_rx: mpsc::UnboundedReceiver<RawNotification>,
    handle: Option<Box<dyn WatchHandle>>,
    poller: Option<JoinHandle<()>>,
    /// Pending re-attach while Recycling.
    retry: Option<(Instant, RecycleReason)>,
}

impl Worker {
    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        let mut recycle_timer = (!self.recycle_every.is_zero()).then(|| {
            let mut t = interval_at(Instant::now() + self.recycle_every, self.recycle_every);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        loop {
            let retry_at = self.retry.as_ref().map(|(at, _)| *at);
            tokio::select! {
                _ = stop_rx.changed() => break,
                Some(raw) = self.raw_rx.recv() => {
                    if self.on_raw(raw) == Flow::Exit {
                        break;
                    }
                }
                _ = next_tick(&mut recycle_timer) => self.recycle(RecycleReason::Interval),
                _ = sleep_until(retry_at) => {
                    if let Some((_, reason)) = self.retry.take() {
                        self.reattach(reason);
                    }
                }
            }
        }
        self.shutdown();
    }

    fn on_raw(&mut self, raw: RawNotification) -> Flow {
        match raw {
            RawNotification::Changed(path) => self.on_change(ChangeType::Changed, path, None),
            RawNotification::Created(path) => self.on_change(ChangeType::Created, path, None),
            RawNotification::Deleted(path) => self.on_change(ChangeType::Deleted, path, None),
            RawNotification::Renamed { from, to } => {
                self.on_change(ChangeType::Renamed, to, Some(from))
            }
            RawNotification::BufferOverflow => {
                self.sink.emit(DaemonEventKind::FileWatcherBufferError);
                if self.recycle_on_error {
                    self.recycle(RecycleReason::WatcherError(
                        "notification buffer overflow".to_string(),
                    ));
                }
            }
            RawNotification::PathNotFound(path) => {
                self.sink.emit(DaemonEventKind::FileWatcherPathError {
                    path,
                    message: "watch path not found".to_string(),
                });
                return self.on_fatal(RecycleReason::PathNotFound);
            }
            RawNotification::Error(message) => {
                self.path_error(message.clone());
                return self.on_fatal(RecycleReason::WatcherError(message));
            }
        }
        Flow::Continue
    }

    fn on_fatal(&mut self, reason: RecycleReason) -> Flow {
        if !self.recycle_on_error {
            return Flow::Exit;
        }
        if self.handle.is_none() && self.retry.is_some() {
            // Already waiting to re-attach.
            return Flow::Continue;
        }
        self.recycle(reason);
        Flow::Continue
    }

    fn on_change(&mut self, change_type: ChangeType, path: PathBuf, old: Option<PathBuf>) {
        let Some(change) = self.selector.select(change_type, path, old) else {
            return;
        };
        if !self.filter.accept(&change) {
            debug!(daemon = %self.sink.daemon(), "Suppressed {change_type} {}", change.full_path.display());
            return;
        }
        {
            let mut rt = lock(&self.runtime);
            rt.event_count += 1;
            rt.last_event_type = Some(change_type);
            rt.last_event_time = Some(change.timestamp);
        }
        self.sink.emit(DaemonEventKind::ChangeAccepted(change.clone()));
        self.dispatcher.dispatch(change, &self.queue);
    }

    async fn startup_search(&mut self) {
        let selector = self.selector.clone();
        let sink = self.sink.clone();
        let found = match spawn_blocking(move || poller::search(&selector, |k| sink.emit(k))).await {
            Ok(found) => found,
            Err(e) => {
                self.sink.emit(DaemonEventKind::FileWatcherSearchError {
                    message: e.to_string(),
                });
                return;
            }
        };
        for path in found {
            self.on_change(ChangeType::SystemGenerated, path, None);
        }
    }

    fn attach(&mut self) -> Result<(), crate::error::WatchError> {
        let handle = self.watch.attach(&self.spec, self.raw_tx.clone())?;
        self.handle = Some(handle);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.detach();
        }
    }

    /// Tears the watch down and builds it again.
    fn recycle(&mut self, reason: RecycleReason) {
        if self.handle.is_none() && self.retry.is_some() {
            return;
        }
        self.detach();
        self.set_state(DaemonState::Recycling);
        self.reattach(reason);
    }

    fn reattach(&mut self, reason: RecycleReason) {
        self.set_state(DaemonState::Starting);
        match self.attach() {
            Ok(()) => {
                self.sink.emit(DaemonEventKind::FileWatcherRecycled { reason });
                self.set_state(DaemonState::Running);
            }
            Err(e) => {
                self.path_error(e.to_string());
                self.schedule_retry(reason);
            }
        }
    }

    fn schedule_retry(&mut self, reason: RecycleReason) {
        self.set_state(DaemonState::Recycling);
        self.retry = Some((Instant::now() + self.retry_delay, reason));
    }

    fn path_error(&self, message: String) {
        self.sink.emit(DaemonEventKind::FileWatcherPathError {
            path: self.spec.path.clone(),
            message,
        });
    }

    fn set_state(&self, state: DaemonState) {
        lock(&self.runtime).state = state;
    }

    fn shutdown(&mut self) {
        self.detach();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.queue.cancel();
        self.set_state(DaemonState::Stopped);
        self.sink.emit(DaemonEventKind::FileWatcherStopped);
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
