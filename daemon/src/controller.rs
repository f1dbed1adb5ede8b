/// Owns every daemon's supervisor and the settings that span all of them.
///
/// Operations run one daemon at a time and are best-effort across the set:
/// a daemon that fails to start is reported and the rest carry on.
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tracing::{info, warn};

use crate::action_queue::QueueLimits;
use crate::config::{validate_set, Config, DaemonConfig, GlobalConfig};
use crate::error::{ConfigError, ControllerError};
use crate::event::DaemonEventKind;
use crate::status::{ControllerStatus, DaemonState, DaemonStatus};
use crate::supervisor::{Collaborators, DaemonSupervisor};

/// Queue limits for `config` after the global overrides.
pub fn effective_limits(config: &DaemonConfig, global: &GlobalConfig) -> QueueLimits {
    QueueLimits {
        batch_size: global
            .process_batch_size
            .unwrap_or(config.process.batch_size),
        synchronized: global
            .synchronized_execution
            .unwrap_or(config.process.synchronized_execution),
        max_wait: match config.process.max_wait_time_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        },
    }
}

pub struct Controller {
    daemons: BTreeMap<String, DaemonSupervisor>,
    collaborators: Collaborators,
    global: GlobalConfig,
}

impl Controller {
    pub fn new(global: GlobalConfig, collaborators: Collaborators) -> Self {
        Self {
            daemons: BTreeMap::new(),
            collaborators,
            global,
        }
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    /// Daemon names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.daemons.keys().cloned().collect()
    }

    pub fn config(&self, name: &str) -> Option<&DaemonConfig> {
        self.daemons.get(name).map(DaemonSupervisor::config)
    }

    /// Registers a new daemon without starting it.
    pub fn add(&mut self, config: DaemonConfig) -> Result<(), ControllerError> {
        self.check(&config)?;
        if self.daemons.contains_key(&config.name) {
            let err = ConfigError::DuplicateName(config.name.clone());
            self.report_config_error(&config, &err);
            return Err(err.into());
        }
        let limits = effective_limits(&config, &self.global);
        let supervisor = DaemonSupervisor::new(config, limits, &self.collaborators);
        info!(daemon = %supervisor.name(), "Daemon added");
        self.daemons.insert(supervisor.name().to_string(), supervisor);
        Ok(())
    }

    /// Adds the daemon, or replaces its configuration. A running daemon is
    /// stopped and restarted so the watch picks up the new settings.
    pub async fn add_or_update(&mut self, config: DaemonConfig) -> Result<(), ControllerError> {
        if !self.daemons.contains_key(&config.name) {
            return self.add(config);
        }
        self.check(&config)?;
        let wait = self.global.wait_for_running_on_stop;
        let limits = effective_limits(&config, &self.global);
        let supervisor = self.supervisor_mut(&config.name)?;
        if supervisor.config() == &config {
            return Ok(());
        }

        let was_active = supervisor.is_active();
        if was_active {
            supervisor.stop(wait).await;
        }
        let enabled = config.enabled;
        supervisor.reconfigure(config, limits);
        info!(daemon = %supervisor.name(), "Daemon reconfigured");
        if was_active && enabled {
            supervisor.start().await?;
        }
        Ok(())
    }

    /// Stops the daemon and forgets it. Returns its last configuration.
    pub async fn remove(&mut self, name: &str) -> Result<DaemonConfig, ControllerError> {
        let wait = self.global.wait_for_running_on_stop;
        let mut supervisor = self
            .daemons
            .remove(name)
            .ok_or_else(|| ControllerError::UnknownDaemon(name.to_string()))?;
        supervisor.stop(wait).await;
        info!(daemon = %name, "Daemon removed");
        Ok(supervisor.config().clone())
    }

    pub async fn start(&mut self, name: &str) -> Result<(), ControllerError> {
        self.supervisor_mut(name)?.start().await
    }

    pub async fn stop(&mut self, name: &str) -> Result<(), ControllerError> {
        let wait = self.global.wait_for_running_on_stop;
        self.supervisor_mut(name)?.stop(wait).await;
        Ok(())
    }

    /// Starts every enabled daemon that is not already active.
    pub async fn start_all(&mut self) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        for supervisor in self.daemons.values_mut() {
            if !supervisor.config().enabled || supervisor.is_active() {
                continue;
            }
            if let Err(e) = supervisor.start().await {
                warn!(daemon = %supervisor.name(), "Failed to start: {e}");
                errors.push(e);
            }
        }
        errors
    }

    pub async fn stop_all(&mut self) {
        let wait = self.global.wait_for_running_on_stop;
        for supervisor in self.daemons.values_mut() {
            supervisor.stop(wait).await;
        }
    }

    /// Overrides every daemon's batch size; `None` returns to per-daemon values.
    pub fn set_global_batch_size(&mut self, batch_size: Option<usize>) {
        self.global.process_batch_size = batch_size;
        self.apply_limits();
    }

    /// Forces serial execution on every daemon; `None` returns to per-daemon values.
    pub fn set_synchronous_execution(&mut self, synchronized: Option<bool>) {
        self.global.synchronized_execution = synchronized;
        self.apply_limits();
    }

    /// Brings the daemon set in line with a freshly loaded configuration.
    ///
    /// Daemons missing from `config` are removed, changed ones are
    /// reconfigured, enabled ones are started and disabled ones stopped.
    /// An invalid daemon set is rejected as a whole.
    pub async fn apply(&mut self, config: Config) -> Vec<ControllerError> {
        if let Err(e) = validate_set(&config.daemons) {
            warn!("Ignoring configuration: {e}");
            return vec![e.into()];
        }

        self.global.wait_for_running_on_stop = config.global.wait_for_running_on_stop;
        self.global.process_batch_size = config.global.process_batch_size;
        self.global.synchronized_execution = config.global.synchronized_execution;
        self.apply_limits();

        let wanted: HashSet<&str> = config.daemons.iter().map(|d| d.name.as_str()).collect();
        let stale: Vec<String> = self
            .daemons
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        let mut errors = Vec::new();
        for name in stale {
            if let Err(e) = self.remove(&name).await {
                errors.push(e);
            }
        }

        for daemon in config.daemons {
            let name = daemon.name.clone();
            let enabled = daemon.enabled;
            if let Err(e) = self.add_or_update(daemon).await {
                errors.push(e);
                continue;
            }
            let Some(supervisor) = self.daemons.get_mut(&name) else {
                continue;
            };
            if enabled && !supervisor.is_active() {
                if let Err(e) = supervisor.start().await {
                    errors.push(e);
                }
            } else if !enabled && supervisor.is_active() {
                supervisor.stop(self.global.wait_for_running_on_stop).await;
            }
        }
        errors
    }

    pub fn status(&self, name: &str) -> Option<DaemonStatus> {
        self.daemons.get(name).map(DaemonSupervisor::status)
    }

    pub fn statuses(&self) -> Vec<DaemonStatus> {
        self.daemons.values().map(DaemonSupervisor::status).collect()
    }

    pub fn controller_status(&self) -> ControllerStatus {
        ControllerStatus::new(self.statuses())
    }

    pub fn running_watchers(&self) -> usize {
        self.daemons
            .values()
            .filter(|d| d.state() == DaemonState::Running)
            .count()
    }

    pub fn running_processes(&self) -> usize {
        self.daemons.values().map(|d| d.queue().running_count()).sum()
    }

    pub fn queued_processes(&self) -> usize {
        self.daemons.values().map(|d| d.queue().queued_count()).sum()
    }

    fn supervisor_mut(&mut self, name: &str) -> Result<&mut DaemonSupervisor, ControllerError> {
        self.daemons
            .get_mut(name)
            .ok_or_else(|| ControllerError::UnknownDaemon(name.to_string()))
    }

    fn apply_limits(&self) {
        for supervisor in self.daemons.values() {
            supervisor.set_limits(effective_limits(supervisor.config(), &self.global));
        }
    }

    fn check(&self, config: &DaemonConfig) -> Result<(), ControllerError> {
        config.validate().map_err(|e| {
            self.report_config_error(config, &e);
            ControllerError::from(e)
        })
    }

    fn report_config_error(&self, config: &DaemonConfig, err: &ConfigError) {
        self.collaborators
            .events
            .for_daemon(&config.name, config.logging.clone())
            .emit(DaemonEventKind::ConfigurationError {
                message: err.to_string(),
            });
    }
}
