//! Supervised osquery-backed monitor
//!
//! Owns one engine subprocess instance end to end: startup with ready
//! detection, the serialized query protocol over its pipes, and a fault
//! watcher that turns known error-stream signatures into bounded,
//! backed-off restarts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fimtrack_core::events::FileEvent;
use fimtrack_core::prelude::*;

use crate::config::{MonitorConfig, FILE_EVENTS_QUERY};
use crate::monitor::{Monitor, MonitorEvent, MonitorState, Row};
use crate::process::{EngineProcess, StderrLines};
use crate::protocol;

/// Error-stream substring indicating recoverable lock contention on the
/// engine's database
const FAULT_SIGNATURE: &str = "IO error: While lock file";

/// Wait intervals between failed restart attempts; the last entry repeats
const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Backoff before the next attempt, given the number of failures so far
/// (1-based). Increases along the schedule, then stays at the cap.
fn backoff_for(retries: u32) -> Duration {
    let idx = (retries.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE.len() - 1);
    BACKOFF_SCHEDULE[idx]
}

/// Monitor backed by a supervised engine subprocess.
///
/// Cheap to clone; all clones share the same engine instance.
#[derive(Clone)]
pub struct OsqueryMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    config: MonitorConfig,
    /// State is published through a watch channel: writers are the
    /// supervisor's own control flow, readers get eventual visibility.
    state: watch::Sender<MonitorState>,
    /// The live process and its pipes. `Some` iff state is Running or
    /// Restarting; the lock serializes every use of the pipes.
    session: Mutex<Option<EngineProcess>>,
    watcher: Mutex<Option<WatcherHandle>>,
    event_tx: mpsc::Sender<MonitorEvent>,
}

struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OsqueryMonitor {
    /// Create a monitor along with the receiver for its out-of-band events
    pub fn new(config: MonitorConfig) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (state, _) = watch::channel(MonitorState::NotStarted);

        (
            Self {
                inner: Arc::new(Inner {
                    config,
                    state,
                    session: Mutex::new(None),
                    watcher: Mutex::new(None),
                    event_tx,
                }),
            },
            event_rx,
        )
    }

    /// Stop-then-start. In-flight queries observe `NotRunning` during the gap.
    pub async fn restart(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Restarting engine");
        self.stop().await?;
        self.start(shutdown).await
    }

    /// Events under a path prefix newer than a timestamp
    pub async fn events_under(&self, path: &str, since: DateTime<Utc>) -> Result<Vec<FileEvent>> {
        let statement = format!(
            "SELECT * FROM file_events WHERE path LIKE '{}%' AND time > {};",
            path.replace('\'', "''"),
            since.timestamp()
        );
        let rows = self.query(&statement).await?;
        Ok(rows.iter().filter_map(FileEvent::from_row).collect())
    }

    /// Grouped counts per operation since a timestamp
    pub async fn changes_summary(&self, since: DateTime<Utc>) -> Result<Vec<Row>> {
        let statement = format!(
            "SELECT action, COUNT(*) AS count, MIN(time) AS first_occurrence, \
             MAX(time) AS last_occurrence FROM file_events WHERE time > {} GROUP BY action;",
            since.timestamp()
        );
        self.query(&statement).await
    }
}

#[async_trait]
impl Monitor for OsqueryMonitor {
    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if self.inner.session.lock().await.is_some() {
            warn!("Engine already running, ignoring start request");
            return Ok(());
        }

        info!("Starting file-event monitoring");
        self.inner.set_state(MonitorState::Starting);

        // Child token: process-level shutdown reaches the watcher, and
        // stop() can cancel this run without touching the parent.
        let run_cancel = shutdown.child_token();

        let stderr = match self.inner.launch(&run_cancel).await {
            Ok(stderr) => stderr,
            Err(Error::Cancelled) => {
                self.inner.set_state(MonitorState::Stopped);
                return Err(Error::Cancelled);
            }
            Err(e) => {
                error!("Engine startup failed: {}", e);
                self.inner.set_state(MonitorState::Failed);
                return Err(e);
            }
        };

        self.inner.set_state(MonitorState::Running);

        let task = tokio::spawn(fault_watch(
            Arc::clone(&self.inner),
            stderr,
            run_cancel.clone(),
        ));
        *self.inner.watcher.lock().await = Some(WatcherHandle {
            cancel: run_cancel,
            task,
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if matches!(
            self.state(),
            MonitorState::NotStarted | MonitorState::Stopped
        ) {
            return Ok(());
        }

        info!("Stopping engine");
        self.inner.set_state(MonitorState::Stopping);

        // Join the watcher first so no restart races the teardown
        let handle = self.inner.watcher.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                debug!("Fault watcher join error: {}", e);
            }
        }

        self.inner.stop_engine().await;
        self.inner.set_state(MonitorState::Stopped);
        info!("Engine stopped");
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<Row>> {
        // The protocol has no request identifiers: one exchange at a time,
        // serialized by the session lock.
        let mut session = self.inner.session.lock().await;

        if self.state() != MonitorState::Running {
            return Err(Error::NotRunning);
        }
        let process = session.as_mut().ok_or(Error::NotRunning)?;

        let exchange = protocol::round_trip(&mut process.stdin, &mut process.stdout, statement);
        match tokio::time::timeout(self.inner.config.query_timeout(), exchange).await {
            Ok(Ok(rows)) => {
                info!(
                    "Query executed successfully (statement: {}, rows: {})",
                    statement,
                    rows.len()
                );
                Ok(rows)
            }
            Ok(Err(e)) => {
                error!("Query failed (statement: {}): {}", statement, e);
                Err(e)
            }
            Err(_) => {
                error!("Query timed out (statement: {})", statement);
                Err(Error::QueryTimeout)
            }
        }
    }

    async fn file_events(&self) -> Result<Vec<FileEvent>> {
        let rows = self.query(FILE_EVENTS_QUERY).await?;
        Ok(rows.iter().filter_map(FileEvent::from_row).collect())
    }

    fn state(&self) -> MonitorState {
        *self.inner.state.borrow()
    }
}

impl Inner {
    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Write the engine config, spawn the process, and wait for ready.
    /// On success the pipes are installed as the current session and the
    /// remaining error stream is returned for the fault watcher.
    async fn launch(&self, cancel: &CancellationToken) -> Result<StderrLines> {
        self.config.write_engine_config().map_err(|e| {
            error!("Failed to write engine config: {}", e);
            e
        })?;

        if let Some(dir) = self.config.database_path().parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                error!("Failed to create database directory: {}", e);
                Error::Io(e)
            })?;
        }

        let (mut process, mut stderr) = EngineProcess::spawn(&self.config)?;
        process.wait_for_ready(&mut stderr, cancel).await?;

        *self.session.lock().await = Some(process);
        Ok(stderr)
    }

    /// Kill the current engine instance, if any. Idempotent.
    async fn stop_engine(&self) {
        if let Some(mut process) = self.session.lock().await.take() {
            process.kill().await;
        }
    }

    async fn restart_engine(&self, cancel: &CancellationToken) -> Result<StderrLines> {
        self.stop_engine().await;
        self.launch(cancel).await
    }
}

enum RestartOutcome {
    /// New engine instance is up; continue watching its error stream
    Resumed(StderrLines),
    /// Retry budget spent
    Exhausted(u32),
    Cancelled,
}

/// Background task: log every engine stderr line and drive supervised
/// restarts when a known fault signature appears.
///
/// Owned by the supervisor and joined on stop, so no watcher ever leaks
/// across restarts.
async fn fault_watch(inner: Arc<Inner>, mut stderr: StderrLines, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Fault watcher cancelled");
                return;
            }
            line = stderr.next_line() => line,
        };

        match next {
            Ok(Some(line)) => {
                warn!("engine stderr: {}", line);

                if line.contains(FAULT_SIGNATURE) {
                    info!("Detected lock file contention, attempting supervised restart");
                    match supervised_restart(&inner, &cancel).await {
                        RestartOutcome::Resumed(new_stderr) => stderr = new_stderr,
                        RestartOutcome::Exhausted(retries) => {
                            inner.set_state(MonitorState::Failed);
                            let _ = inner
                                .event_tx
                                .send(MonitorEvent::SupervisionExhausted { retries })
                                .await;
                            return;
                        }
                        RestartOutcome::Cancelled => return,
                    }
                }
            }
            Ok(None) => {
                // Error stream EOF. During a deliberate stop that is
                // expected; otherwise the engine died under us.
                if inner.state() != MonitorState::Running {
                    return;
                }
                let code = match inner.session.lock().await.take() {
                    Some(process) => process.wait_code().await,
                    None => None,
                };
                error!("Engine exited unexpectedly (code: {:?})", code);
                inner.set_state(MonitorState::Failed);
                let _ = inner.event_tx.send(MonitorEvent::EngineExited { code }).await;
                return;
            }
            Err(e) => {
                error!("Error reading engine stderr: {}", e);
                return;
            }
        }
    }
}

/// Bounded retry loop around engine restarts.
///
/// The counter covers one fault episode: it increments per failed attempt
/// and is discarded on success, so the next fault starts from zero again.
async fn supervised_restart(inner: &Arc<Inner>, cancel: &CancellationToken) -> RestartOutcome {
    inner.set_state(MonitorState::Restarting);
    let mut retries: u32 = 0;

    loop {
        match inner.restart_engine(cancel).await {
            Ok(stderr) => {
                info!(
                    "Successfully restarted engine after fault (failed attempts: {})",
                    retries
                );
                inner.set_state(MonitorState::Running);
                let _ = inner
                    .event_tx
                    .send(MonitorEvent::Restarted { attempts: retries })
                    .await;
                return RestartOutcome::Resumed(stderr);
            }
            Err(Error::Cancelled) => {
                info!("Cancellation received, stopping restart attempts");
                return RestartOutcome::Cancelled;
            }
            Err(e) => {
                retries += 1;
                warn!("Failed to restart engine (retry {}): {}", retries, e);

                if retries >= inner.config.max_retries() {
                    error!(
                        "Failed to restart engine after maximum retries ({})",
                        inner.config.max_retries()
                    );
                    return RestartOutcome::Exhausted(retries);
                }

                let backoff = backoff_for(retries);
                info!("Waiting {:?} before next restart attempt", backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        info!("Cancellation received, stopping restart attempts");
                        return RestartOutcome::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEST_TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn test_backoff_schedule_increases_then_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(3));
        assert_eq!(backoff_for(3), Duration::from_secs(5));
        assert_eq!(backoff_for(4), Duration::from_secs(5));
        assert_eq!(backoff_for(100), Duration::from_secs(5));
    }

    #[cfg(unix)]
    fn write_script(temp: &TempDir, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = temp.path().join("fake-engine.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    fn script_monitor(
        temp: &TempDir,
        script: &Path,
        max_retries: u32,
    ) -> (OsqueryMonitor, mpsc::Receiver<MonitorEvent>) {
        let config = MonitorConfig::builder()
            .config_path(temp.path().join("engine.conf"))
            .database_path(temp.path().join("data").join("engine.db"))
            .engine_binary(script)
            .max_retries(max_retries)
            .query_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        OsqueryMonitor::new(config)
    }

    /// A fake engine that signals ready and then answers every input line
    /// with a fixed single-event JSON array.
    const RESPONDER: &str = r#"echo 'I0000 Osquery started successfully' >&2
while IFS= read -r line; do
  echo '[{"target_path":"/tmp/demo.txt","action":"CREATED","time":"1700000000"}]'
done"#;

    #[tokio::test]
    async fn test_query_before_start_is_not_running() {
        let temp = TempDir::new().unwrap();
        let config = MonitorConfig::builder()
            .config_path(temp.path().join("engine.conf"))
            .build()
            .unwrap();
        let (monitor, _events) = OsqueryMonitor::new(config);

        let result = monitor.query("SELECT 1;").await;
        assert!(matches!(result, Err(Error::NotRunning)));
        assert_eq!(monitor.state(), MonitorState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_query_stop_lifecycle() {
        let temp = TempDir::new().unwrap();
        let script = write_script(&temp, RESPONDER);
        let (monitor, _events) = script_monitor(&temp, &script, 3);

        let shutdown = CancellationToken::new();
        tokio::time::timeout(TEST_TIMEOUT, monitor.start(shutdown))
            .await
            .expect("start should not hang")
            .expect("start should succeed");
        assert_eq!(monitor.state(), MonitorState::Running);

        // The engine config must exist before the process came up
        assert!(temp.path().join("engine.conf").exists());
        assert!(temp.path().join("data").exists());

        let events = tokio::time::timeout(TEST_TIMEOUT, monitor.file_events())
            .await
            .expect("query should not hang")
            .expect("query should succeed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "/tmp/demo.txt");

        // Derived queries go through the same protocol
        let since = Utc.timestamp_opt(0, 0).unwrap();
        let under = monitor.events_under("/tmp", since).await.unwrap();
        assert_eq!(under.len(), 1);
        let summary = monitor.changes_summary(since).await.unwrap();
        assert_eq!(summary.len(), 1);

        monitor.stop().await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);

        // Stop is idempotent
        monitor.stop().await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);

        // Queries after stop fail fast instead of blocking
        let result = monitor.query("SELECT 1;").await;
        assert!(matches!(result, Err(Error::NotRunning)));

        // Restart brings a fresh engine instance up
        monitor.restart(CancellationToken::new()).await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);
        monitor.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_cancellation() {
        let temp = TempDir::new().unwrap();
        // Never signals ready
        let script = write_script(&temp, "sleep 30");
        let (monitor, _events) = script_monitor(&temp, &script, 3);

        let shutdown = CancellationToken::new();
        let cancel_trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_trigger.cancel();
        });

        let result = tokio::time::timeout(TEST_TIMEOUT, monitor.start(shutdown))
            .await
            .expect("cancelled start should return promptly");
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fault_triggers_successful_restart() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("restarted.marker");
        // First run: emit the fault signature and hang. Second run (marker
        // present): behave like a healthy responder.
        let body = format!(
            r#"echo 'I0000 Osquery started successfully' >&2
if [ ! -e '{marker}' ]; then
  : > '{marker}'
  echo 'E0000 IO error: While lock file /tmp/engine.db/LOCK: locked' >&2
  sleep 30
else
  while IFS= read -r line; do
    echo '[{{"target_path":"/tmp/after-restart","action":"UPDATED","time":"1700000001"}}]'
  done
fi"#,
            marker = marker.display()
        );
        let script = write_script(&temp, &body);
        let (monitor, mut events) = script_monitor(&temp, &script, 3);

        monitor.start(CancellationToken::new()).await.unwrap();

        let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("restart event should arrive")
            .expect("event channel open");
        match event {
            MonitorEvent::Restarted { attempts } => assert_eq!(attempts, 0),
            other => panic!("expected Restarted, got {:?}", other),
        }

        assert_eq!(monitor.state(), MonitorState::Running);

        let rows = tokio::time::timeout(TEST_TIMEOUT, monitor.file_events())
            .await
            .expect("query after restart should not hang")
            .expect("query after restart should succeed");
        assert_eq!(rows[0].path, "/tmp/after-restart");

        monitor.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervision_exhausted_after_max_retries() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("first-run.marker");
        // First run signals ready and then faults; every later run exits
        // immediately before signaling ready, so each restart attempt fails.
        let body = format!(
            r#"if [ -e '{marker}' ]; then
  exit 7
fi
: > '{marker}'
echo 'I0000 Osquery started successfully' >&2
echo 'E0000 IO error: While lock file /tmp/engine.db/LOCK: locked' >&2
sleep 30"#,
            marker = marker.display()
        );
        let script = write_script(&temp, &body);
        let (monitor, mut events) = script_monitor(&temp, &script, 2);

        monitor.start(CancellationToken::new()).await.unwrap();

        let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("exhaustion event should arrive")
            .expect("event channel open");
        match event {
            MonitorEvent::SupervisionExhausted { retries } => assert_eq!(retries, 2),
            other => panic!("expected SupervisionExhausted, got {:?}", other),
        }

        assert_eq!(monitor.state(), MonitorState::Failed);

        // The daemon keeps running; queries just fail until a fresh start
        let result = monitor.query("SELECT 1;").await;
        assert!(matches!(result, Err(Error::NotRunning)));
    }
}
