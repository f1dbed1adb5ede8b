/// Per-daemon action queue and batch runner.
///
/// Actions wait in a FIFO until the running set has room. The running set holds
/// at most `batch_size` actions, or one when synchronized execution is on. An
/// action keeps its slot until its process exits (or its service call returns);
/// a synchronized wait that exceeds `max_wait` releases the slot early and the
/// process finishes detached, reporting its exit late.
///
/// Actions with a future `not_before` (process delay, readiness retry) are parked
/// on a timer. When it fires they rejoin the FIFO at their enqueue position, so
/// the queue stays ordered by arrival. With synchronized execution a parked
/// action also holds back everything that arrived after it.
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::change::{ChangeEvent, ChangeType};
use crate::config::DaemonConfig;
use crate::dispatcher::build_service_request;
use crate::event::{DaemonEventKind, DaemonSink};
use crate::launcher::{LaunchedProcess, ProcessLauncher, ProcessSpec};
use crate::readiness::{CancelReason, FileProbe, FileReadinessChecker, Readiness};
use crate::rename::{FileRenamer, RenameOutcome};
use crate::service::{RemoteServiceClient, ServiceFailure, ServiceOutcome};

const NO_SERVICE_CLIENT: &str = "no remote service client configured";
/// How long an exit report waits for the process's remaining output lines.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    RunProcess(ProcessSpec),
    CallService { stream_file: bool },
}

/// One unit of work for a daemon. Lives in exactly one queue at a time.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub id: Uuid,
    pub daemon: String,
    pub kind: ActionKind,
    pub change: Arc<ChangeEvent>,
    /// Readiness checks already made.
    pub lock_attempts: u32,
    /// Rename passes already made.
    pub rename_attempts: u32,
    pub created_at: Instant,
    /// Earliest instant the action may start.
    pub not_before: Instant,
    generation: u64,
    /// Arrival order within the queue.
    seq: u64,
}

impl QueuedAction {
    pub fn new(kind: ActionKind, change: Arc<ChangeEvent>, delay: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            daemon: change.daemon.clone(),
            kind,
            change,
            lock_attempts: 0,
            rename_attempts: 0,
            created_at: now,
            not_before: now + delay,
            generation: 0,
            seq: 0,
        }
    }
}

/// Collaborators shared by every queue.
pub struct ActionRuntime {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub service: Option<Arc<dyn RemoteServiceClient>>,
    pub probe: Arc<dyn FileProbe>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub batch_size: usize,
    pub synchronized: bool,
    /// Upper bound of a synchronized wait; `None` waits until exit.
    pub max_wait: Option<Duration>,
}

impl QueueLimits {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            batch_size: config.process.batch_size,
            synchronized: config.process.synchronized_execution,
            max_wait: match config.process.max_wait_time_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        if self.synchronized {
            1
        } else {
            self.batch_size.max(1)
        }
    }
}

/// Per-daemon work settings, swapped as a whole on reconfiguration.
struct ActionSettings {
    checker: FileReadinessChecker,
    renamer: Option<FileRenamer>,
    sink: DaemonSink,
}

impl ActionSettings {
    fn new(config: &DaemonConfig, sink: DaemonSink) -> Self {
        Self {
            checker: FileReadinessChecker::new(&config.file_processing),
            renamer: config
                .rename
                .enabled
                .then(|| FileRenamer::new(&config.rename)),
            sink,
        }
    }
}

struct QueueState {
    pending: VecDeque<QueuedAction>,
    delayed: HashMap<Uuid, QueuedAction>,
    running: HashSet<Uuid>,
    /// Processes whose synchronized wait was abandoned and are still running.
    detached: usize,
    peak_running: usize,
    generation: u64,
    next_seq: u64,
    limits: QueueLimits,
    settings: Arc<ActionSettings>,
}

struct QueueInner {
    daemon: String,
    runtime: Arc<ActionRuntime>,
    state: Mutex<QueueState>,
    changed: Notify,
}

#[derive(Clone)]
pub struct ActionQueue {
    inner: Arc<QueueInner>,
}

enum Step {
    Done,
    Requeue(QueuedAction, Duration),
}

impl ActionQueue {
    pub fn new(
        config: &DaemonConfig,
        limits: QueueLimits,
        runtime: Arc<ActionRuntime>,
        sink: DaemonSink,
    ) -> Self {
        let state = QueueState {
            pending: VecDeque::new(),
            delayed: HashMap::new(),
            running: HashSet::new(),
            detached: 0,
            peak_running: 0,
            generation: 0,
            next_seq: 0,
            limits,
            settings: Arc::new(ActionSettings::new(config, sink)),
        };
        Self {
            inner: Arc::new(QueueInner {
                daemon: config.name.clone(),
                runtime,
                state: Mutex::new(state),
                changed: Notify::new(),
            }),
        }
    }

    pub fn daemon(&self) -> &str {
        &self.inner.daemon
    }

    /// Applies new per-daemon settings. Running actions keep the old ones.
    pub fn reconfigure(&self, config: &DaemonConfig, limits: QueueLimits, sink: DaemonSink) {
        {
            let mut state = self.inner.state();
            state.settings = Arc::new(ActionSettings::new(config, sink));
            state.limits = limits;
        }
        pump(&self.inner);
    }

    pub fn limits(&self) -> QueueLimits {
        self.inner.state().limits
    }

    pub fn set_limits(&self, limits: QueueLimits) {
        self.inner.state().limits = limits;
        pump(&self.inner);
    }

    pub fn enqueue(&self, mut action: QueuedAction) {
        let timer = {
            let mut state = self.inner.state();
            action.generation = state.generation;
            action.seq = state.next_seq;
            state.next_seq += 1;
            state.place(action)
        };
        if let Some((id, wake_at)) = timer {
            arm(&self.inner, id, wake_at);
        }
        pump(&self.inner);
    }

    /// Drops every action that has not started. Running actions are left alone
    /// and nothing is reported for the dropped ones.
    pub fn cancel(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state();
            let dropped = state.pending.len() + state.delayed.len();
            state.pending.clear();
            state.delayed.clear();
            state.generation += 1;
            dropped
        };
        if dropped > 0 {
            debug!(daemon = %self.inner.daemon, "Dropped {dropped} queued action(s)");
        }
        self.inner.changed.notify_waiters();
        dropped
    }

    /// Waits until nothing is queued, parked or running.
    pub async fn drain(&self) {
        self.wait_until(|s| s.pending.is_empty() && s.delayed.is_empty() && s.running.is_empty())
            .await
    }

    /// Waits until the running set is empty.
    pub async fn wait_running(&self) {
        self.wait_until(|s| s.running.is_empty()).await
    }

    pub fn queued_count(&self) -> usize {
        let state = self.inner.state();
        state.pending.len() + state.delayed.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state().running.len()
    }

    pub fn detached_count(&self) -> usize {
        self.inner.state().detached
    }

    /// Highest number of simultaneously running actions seen so far.
    pub fn peak_running(&self) -> usize {
        self.inner.state().peak_running
    }

    async fn wait_until(&self, done: impl Fn(&QueueState) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            if done(&self.inner.state()) {
                return;
            }
            notified.await;
        }
    }
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueueState {
    /// Puts `action` in the FIFO at its arrival position, or parks it until
    /// `not_before`. Returns the timer to arm for a parked action.
    fn place(&mut self, action: QueuedAction) -> Option<(Uuid, Instant)> {
        if action.not_before > Instant::now() {
            let timer = (action.id, action.not_before);
            self.delayed.insert(action.id, action);
            return Some(timer);
        }
        self.insert_pending(action);
        None
    }

    fn insert_pending(&mut self, action: QueuedAction) {
        let at = self.pending.partition_point(|a| a.seq < action.seq);
        self.pending.insert(at, action);
    }

    /// Whether the head of the FIFO may start now. Under synchronized execution
    /// an earlier arrival that is still parked goes first.
    fn head_may_start(&self) -> bool {
        let Some(head) = self.pending.front() else {
            return false;
        };
        !self.limits.synchronized || self.delayed.values().all(|a| a.seq > head.seq)
    }
}

/// Moves parked action `id` into the FIFO once `wake_at` has passed.
fn arm(inner: &Arc<QueueInner>, id: Uuid, wake_at: Instant) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep_until(wake_at.into()).await;
        let ready = {
            let mut state = inner.state();
            match state.delayed.remove(&id) {
                Some(action) => {
                    state.insert_pending(action);
                    true
                }
                // Canceled while parked.
                None => false,
            }
        };
        if ready {
            pump(&inner);
        }
    });
}

/// Starts queued actions while the running set has room.
fn pump(inner: &Arc<QueueInner>) {
    let (started, settings, limits) = {
        let mut state = inner.state();
        let capacity = state.limits.capacity();
        let mut started = Vec::new();
        while state.running.len() < capacity && state.head_may_start() {
            let Some(action) = state.pending.pop_front() else {
                break;
            };
            state.running.insert(action.id);
            started.push(action);
        }
        state.peak_running = state.peak_running.max(state.running.len());
        (started, Arc::clone(&state.settings), state.limits)
    };

    for action in started {
        let inner = Arc::clone(inner);
        let settings = Arc::clone(&settings);
        tokio::spawn(async move {
            let id = action.id;
            let step = execute(&inner, &settings, limits, action).await;
            finish(&inner, id, step);
        });
    }
}

/// Releases the slot of `id`, parks a retry if one was asked for, and refills.
fn finish(inner: &Arc<QueueInner>, id: Uuid, step: Step) {
    let timer = {
        let mut state = inner.state();
        state.running.remove(&id);
        match step {
            // Keeps its arrival position, parked in the same critical section
            // so no later action can slip past it.
            Step::Requeue(mut action, delay) if action.generation == state.generation => {
                action.not_before = Instant::now() + delay;
                state.place(action)
            }
            _ => None,
        }
    };
    if let Some((id, wake_at)) = timer {
        arm(inner, id, wake_at);
    }
    pump(inner);
    inner.changed.notify_waiters();
}

async fn execute(
    inner: &Arc<QueueInner>,
    settings: &ActionSettings,
    limits: QueueLimits,
    mut action: QueuedAction,
) -> Step {
    let sink = &settings.sink;
    let path = action.change.full_path.clone();
    let file_present = action.change.change_type != ChangeType::Deleted;

    if file_present && settings.checker.is_active() {
        let attempt = action.lock_attempts + 1;
        let checker = settings.checker.clone();
        let probe = Arc::clone(&inner.runtime.probe);
        let target = path.clone();
        let readiness = spawn_blocking(move || checker.check(probe.as_ref(), &target, attempt))
            .await
            .unwrap_or_else(|e| {
                warn!(daemon = %inner.daemon, "Readiness check panicked: {e}");
                Readiness::GiveUp(CancelReason::FileLockTestFailed)
            });
        action.lock_attempts = attempt;

        match readiness {
            Readiness::Ready => {}
            Readiness::Retry { delay } => {
                debug!(
                    daemon = %inner.daemon,
                    "{} not ready (attempt {attempt}), retrying in {delay:?}",
                    path.display()
                );
                return Step::Requeue(action, delay);
            }
            Readiness::GiveUp(reason) => {
                cancel_action(sink, &action, path, reason);
                return Step::Done;
            }
        }
    }

    if let (true, Some(renamer)) = (file_present, settings.renamer.clone()) {
        action.rename_attempts += 1;
        let target = path.clone();
        let outcome = spawn_blocking(move || renamer.try_rename(&target))
            .await
            .unwrap_or(RenameOutcome::GiveUp);
        if outcome == RenameOutcome::GiveUp {
            cancel_action(sink, &action, path, CancelReason::RenameFailed);
            return Step::Done;
        }
    }

    match &action.kind {
        ActionKind::RunProcess(spec) => run_process(inner, sink, limits, action.id, spec).await,
        ActionKind::CallService { stream_file } => {
            call_service(inner, sink, &action, *stream_file).await
        }
    }
    Step::Done
}

fn cancel_action(sink: &DaemonSink, action: &QueuedAction, path: PathBuf, reason: CancelReason) {
    sink.emit(DaemonEventKind::ProcessCanceled {
        action_id: action.id,
        path,
        reason,
    });
}

async fn run_process(
    inner: &Arc<QueueInner>,
    sink: &DaemonSink,
    limits: QueueLimits,
    action_id: Uuid,
    spec: &ProcessSpec,
) {
    let started_at = Instant::now();
    let LaunchedProcess {
        pid,
        mut exit,
        mut output,
    } = match inner.runtime.launcher.launch(spec) {
        Ok(launched) => launched,
        Err(e) => {
            sink.emit(DaemonEventKind::ProcessError {
                action_id,
                message: e.to_string(),
            });
            return;
        }
    };

    sink.emit(DaemonEventKind::ProcessStarted {
        action_id,
        pid,
        file_name: spec.file_name.clone(),
        arguments: spec.arguments.clone(),
    });

    let forwarder = {
        let sink = sink.clone();
        tokio::spawn(async move {
            while let Some((stream, line)) = output.recv().await {
                sink.emit(DaemonEventKind::ProcessData {
                    action_id,
                    stream,
                    line,
                });
            }
        })
    };

    let max_wait = if limits.synchronized { limits.max_wait } else { None };
    let Some(max_wait) = max_wait else {
        let code = exit.await.ok().and_then(|e| e.code);
        finish_output(&inner.daemon, forwarder).await;
        emit_exit(sink, action_id, code, started_at, false);
        return;
    };

    match tokio::time::timeout(max_wait, &mut exit).await {
        Ok(result) => {
            let code = result.ok().and_then(|e| e.code);
            finish_output(&inner.daemon, forwarder).await;
            emit_exit(sink, action_id, code, started_at, false);
        }
        Err(_) => {
            warn!(
                daemon = %inner.daemon,
                pid = ?pid,
                "Synchronized wait abandoned after {max_wait:?}, process keeps running"
            );
            inner.state().detached += 1;
            let inner = Arc::clone(inner);
            let sink = sink.clone();
            tokio::spawn(async move {
                let code = exit.await.ok().and_then(|e| e.code);
                finish_output(&inner.daemon, forwarder).await;
                emit_exit(&sink, action_id, code, started_at, true);
                {
                    let mut state = inner.state();
                    state.detached = state.detached.saturating_sub(1);
                }
                inner.changed.notify_waiters();
            });
        }
    }
}

/// Lets the last output lines reach observers before the exit is reported.
/// A descendant still holding the pipes open is not waited for.
async fn finish_output(daemon: &str, forwarder: JoinHandle<()>) {
    if tokio::time::timeout(OUTPUT_DRAIN_GRACE, forwarder).await.is_err() {
        debug!(daemon = %daemon, "Output still open after exit, reporting exit first");
    }
}

fn emit_exit(sink: &DaemonSink, action_id: Uuid, code: Option<i32>, started_at: Instant, late: bool) {
    sink.emit(DaemonEventKind::ProcessExited {
        action_id,
        exit_code: code,
        duration: started_at.elapsed(),
        late,
    });
}

async fn call_service(
    inner: &Arc<QueueInner>,
    sink: &DaemonSink,
    action: &QueuedAction,
    stream_file: bool,
) {
    let action_id = action.id;
    let Some(client) = inner.runtime.service.clone() else {
        sink.emit(DaemonEventKind::ServiceProxyCreationError {
            action_id,
            message: NO_SERVICE_CLIENT.to_string(),
        });
        return;
    };

    let change = Arc::clone(&action.change);
    let request = match spawn_blocking(move || build_service_request(action_id, &change, stream_file)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            sink.emit(DaemonEventKind::ServiceProxyCreationError {
                action_id,
                message: e.to_string(),
            });
            return;
        }
        Err(e) => {
            sink.emit(DaemonEventKind::ServiceProxyCreationError {
                action_id,
                message: format!("request builder panicked: {e}"),
            });
            return;
        }
    };

    sink.emit(DaemonEventKind::ServiceBeginCall { action_id });
    match client.call(request).await {
        ServiceOutcome::Success(response) => {
            sink.emit(DaemonEventKind::ServiceCalled { action_id, response })
        }
        ServiceOutcome::Fault(fault) => sink.emit(DaemonEventKind::ServiceError {
            action_id,
            failure: ServiceFailure::Fault(fault),
        }),
        ServiceOutcome::TransportError(message) => sink.emit(DaemonEventKind::ServiceError {
            action_id,
            failure: ServiceFailure::Transport(message),
        }),
    }
}
