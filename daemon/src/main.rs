use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dirwatch_daemon::action_queue::ActionRuntime;
use dirwatch_daemon::config::{self, Config};
use dirwatch_daemon::launcher::TokioProcessLauncher;
use dirwatch_daemon::readiness::OsFileProbe;
use dirwatch_daemon::status::write_status;
use dirwatch_daemon::watch::NotifyWatchPrimitive;
use dirwatch_daemon::{paths, Collaborators, Controller, DaemonEventKind, EventSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir()?;
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create app data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path()?;
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        error!("Config error (starting with no daemons): {e:#}");
        Config::default()
    });
    let status_path = paths::status_file_path()?;

    // ── Controller ────────────────────────────────────────────────────────────
    let (events, mut event_rx) = EventSink::channel();
    let collaborators = Collaborators {
        watch: Arc::new(NotifyWatchPrimitive),
        runtime: Arc::new(ActionRuntime {
            launcher: Arc::new(TokioProcessLauncher),
            service: None,
            probe: Arc::new(OsFileProbe),
        }),
        events,
    };
    let mut controller = Controller::new(initial_config.global.clone(), collaborators);
    for e in controller.apply(initial_config).await {
        warn!("{e}");
    }
    write_status(&status_path, &controller.controller_status());

    let (reload_tx, mut reload_rx) = mpsc::channel::<Config>(4);
    tokio::spawn(config::watch_config(config_path, reload_tx));

    info!(
        "dirwatch-daemon v{} started with {} daemon(s)",
        env!("CARGO_PKG_VERSION"),
        controller.names().len()
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {e}");
                }
                break;
            }
            Some(new_config) = reload_rx.recv() => {
                info!("Config reloaded");
                for e in controller.apply(new_config).await {
                    warn!("{e}");
                }
                write_status(&status_path, &controller.controller_status());
            }
            Some(event) = event_rx.recv() => {
                // Output lines are too frequent to rewrite the status file for.
                if !matches!(event.kind, DaemonEventKind::ProcessData { .. }) {
                    write_status(&status_path, &controller.controller_status());
                }
            }
        }
    }

    info!("Shutting down");
    controller.stop_all().await;
    write_status(&status_path, &controller.controller_status());
    Ok(())
}
