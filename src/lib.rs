//! File Modification Tracker
//!
//! Wires the supervised query engine, the daemon control loop, and the
//! HTTP surface together. The binary entry point lives in `main.rs`; all
//! logic lives here.

pub mod config;
pub mod daemon;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fimtrack_core::prelude::*;
use fimtrack_monitor::{Monitor, OsqueryMonitor};

use crate::config::Settings;
use crate::daemon::{CommandQueue, Daemon};
use crate::server::AppState;
use crate::store::{EventStore, MemoryStore};

/// Run the agent until a shutdown signal arrives.
pub async fn run(settings: Settings) -> Result<()> {
    let monitor_config = settings.monitor_config()?;
    let (monitor, monitor_events) = OsqueryMonitor::new(monitor_config);
    let monitor: Arc<dyn Monitor> = Arc::new(monitor);
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());

    let (queue, commands) = CommandQueue::bounded(settings.daemon.queue_capacity);
    let shutdown = CancellationToken::new();

    let daemon = Daemon::new(
        Arc::clone(&monitor),
        store,
        Duration::from_secs(settings.daemon.tick_secs),
        shutdown.clone(),
    );
    let mut daemon_task = tokio::spawn(async move { daemon.run(commands, monitor_events).await });

    let state = AppState {
        monitor: Arc::clone(&monitor),
        queue,
    };
    let bind = settings.server.bind.clone();
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move { server::serve(&bind, state, server_shutdown).await });

    // Block until something ends the process: an operator signal, or the
    // daemon dying on its own (e.g. the engine failed to start).
    let mut daemon_done = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        result = &mut daemon_task => {
            report_task_exit("Daemon", result);
            daemon_done = true;
        }
    }

    info!("Initiating graceful shutdown...");
    shutdown.cancel();

    // Bounded teardown: past the timeout, in-flight work is abandoned
    let teardown = async {
        if !daemon_done {
            report_task_exit("Daemon", daemon_task.await);
        }
        report_task_exit("HTTP server", server_task.await);
    };

    let window = Duration::from_secs(settings.daemon.shutdown_timeout_secs);
    if tokio::time::timeout(window, teardown).await.is_err() {
        warn!("Shutdown timed out after {:?}, abandoning in-flight work", window);
    } else {
        info!("Graceful shutdown completed");
    }

    Ok(())
}

fn report_task_exit(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("{} stopped", name),
        Ok(Err(e)) if e.is_lifecycle() => {
            error!("{} stopped: engine unusable until restarted: {}", name, e);
        }
        Ok(Err(e)) => error!("{} stopped with error: {}", name, e),
        Err(e) => error!("{} task panicked: {}", name, e),
    }
}

/// Resolve when the process is asked to stop (SIGINT or SIGTERM).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
