//! Watches directories and reacts to file changes by running processes or
//! calling a remote service, one independently configured daemon per directory.

pub mod action_queue;
pub mod change;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod filter;
pub mod launcher;
pub mod paths;
pub mod poller;
pub mod readiness;
pub mod rename;
pub mod service;
pub mod status;
pub mod supervisor;
pub mod watch;

pub use controller::Controller;
pub use event::{DaemonEvent, DaemonEventKind, EventSink};
pub use supervisor::Collaborators;
