/// Turns an accepted change into the actions its daemon is configured for.
use std::io;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::action_queue::{ActionKind, ActionQueue, QueuedAction};
use crate::change::ChangeEvent;
use crate::config::{DaemonConfig, ProcessSettings, ServiceSettings};
use crate::launcher::ProcessSpec;
use crate::service::ServiceRequest;

#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    process: ProcessSettings,
    service: ServiceSettings,
    delay: Duration,
}

impl ActionDispatcher {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            process: config.process.clone(),
            service: config.service.clone(),
            delay: Duration::from_millis(config.file_processing.process_delay_ms),
        }
    }

    /// Enqueues one action per enabled reaction. Returns how many were queued.
    pub fn dispatch(&self, change: ChangeEvent, queue: &ActionQueue) -> usize {
        let actions = self.actions_for(Arc::new(change));
        let count = actions.len();
        for action in actions {
            queue.enqueue(action);
        }
        count
    }

    pub fn actions_for(&self, change: Arc<ChangeEvent>) -> Vec<QueuedAction> {
        let mut actions = Vec::with_capacity(2);
        if self.process.enabled {
            let spec = self.process_spec(&change);
            actions.push(QueuedAction::new(
                ActionKind::RunProcess(spec),
                Arc::clone(&change),
                self.delay,
            ));
        }
        if self.service.call_service {
            actions.push(QueuedAction::new(
                ActionKind::CallService {
                    stream_file: self.service.stream_file,
                },
                change,
                self.delay,
            ));
        }
        actions
    }

    fn process_spec(&self, change: &ChangeEvent) -> ProcessSpec {
        let p = &self.process;
        ProcessSpec {
            file_name: p.file_name.clone().unwrap_or_default(),
            arguments: self.arguments_for(change),
            verb: p.verb.clone(),
            working_directory: p.working_directory.clone(),
            use_shell_execute: p.use_shell_execute,
            window_style: p.window_style,
            create_no_window: p.create_no_window,
            redirect_stdout: p.redirect_standard_output,
            redirect_stderr: p.redirect_standard_error,
            run_as: p.run_as.clone(),
        }
    }

    /// Expands the argument template for `change`.
    ///
    /// An enabled token is replaced everywhere it occurs, values are inserted
    /// verbatim. When its escape string is empty the value is appended to the
    /// end instead.
    pub fn arguments_for(&self, change: &ChangeEvent) -> String {
        let p = &self.process;
        let full_path = change.full_path.to_string_lossy();
        let old_path = change
            .old_full_path
            .as_deref()
            .map(|old| old.to_string_lossy().into_owned())
            .unwrap_or_default();

        let tokens = [
            (p.use_file_name_as_argument, p.file_name_escape.as_str(), &*full_path),
            (
                p.use_old_file_name_as_argument,
                p.old_file_name_escape.as_str(),
                old_path.as_str(),
            ),
            (
                p.use_change_type_as_argument,
                p.change_type_escape.as_str(),
                change.change_type.as_str(),
            ),
        ];

        let inline: Vec<(&str, &str)> = tokens
            .iter()
            .filter(|(enabled, escape, _)| *enabled && !escape.is_empty())
            .map(|(_, escape, value)| (*escape, *value))
            .collect();
        let mut args = substitute(&p.arguments, &inline);

        for (enabled, escape, value) in tokens {
            if !enabled || !escape.is_empty() || value.is_empty() {
                continue;
            }
            if !args.is_empty() {
                args.push(' ');
            }
            args.push_str(&quote(value));
        }
        args
    }
}

/// Replaces every escape in `template` with its value in one left-to-right
/// pass. Substituted text is never scanned again.
fn substitute(template: &str, tokens: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while !rest.is_empty() {
        for (escape, value) in tokens {
            if let Some(tail) = rest.strip_prefix(escape) {
                out.push_str(value);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn quote(value: &str) -> String {
    if value.contains(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Hex encoded SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Builds the remote call for `change`. Blocking when `stream_file` is set: the
/// file is read and hashed here.
pub fn build_service_request(
    action_id: Uuid,
    change: &ChangeEvent,
    stream_file: bool,
) -> io::Result<ServiceRequest> {
    let (content, digest) = if stream_file {
        let bytes = std::fs::read(&change.full_path)?;
        let sum = checksum(&bytes);
        (Some(bytes), Some(sum))
    } else {
        (None, change.checksum.clone())
    };

    Ok(ServiceRequest {
        daemon: change.daemon.clone(),
        action_id,
        change_type: change.change_type,
        name: change.name.clone(),
        full_path: change.full_path.clone(),
        old_full_path: change.old_full_path.clone(),
        timestamp: change.timestamp,
        checksum: digest,
        content,
    })
}
