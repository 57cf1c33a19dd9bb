//! Daemon control loop and command hand-off
//!
//! The daemon owns the monitor's lifecycle for the lifetime of the process
//! and turns queued, pre-validated operator commands into subprocess
//! executions. Commands reach it through a bounded queue; a full queue is
//! reported to the producer instead of growing.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command as OsCommand;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fimtrack_core::prelude::*;
use fimtrack_monitor::{Monitor, MonitorEvent};

use crate::store::EventStore;

/// Captured command output is clipped at this many bytes
const OUTPUT_LIMIT: usize = 64 * 1024;

/// A validated operator command, owned by the queue until dequeued
/// exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

/// Producer side of the bounded command hand-off.
///
/// Cloneable: every HTTP handler task can hold one. Enqueueing never
/// blocks; a full queue surfaces as `QueueFull` backpressure.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Command>,
}

impl CommandQueue {
    /// Create a queue with a fixed capacity, returning the consumer end
    /// for the daemon loop.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn try_enqueue(&self, command: Command) -> Result<()> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed,
        })
    }
}

/// Orchestrates the monitor lifecycle and drains the command queue.
pub struct Daemon {
    monitor: Arc<dyn Monitor>,
    store: Arc<dyn EventStore>,
    tick: Duration,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(
        monitor: Arc<dyn Monitor>,
        store: Arc<dyn EventStore>,
        tick: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            monitor,
            store,
            tick,
            shutdown,
        }
    }

    /// Run the control loop until cancellation.
    ///
    /// Starts the monitor exactly once on entry and stops it exactly once
    /// on the way out. Supervised restarts in between are the monitor's
    /// fault watcher's business; this loop only observes and logs them.
    pub async fn run(
        &self,
        mut commands: mpsc::Receiver<Command>,
        mut monitor_events: mpsc::Receiver<MonitorEvent>,
    ) -> Result<()> {
        info!("Starting daemon...");
        self.monitor.start(self.shutdown.clone()).await?;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would race engine warm-up
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Daemon stopping due to cancellation");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("Performing periodic check");
                    if let Err(e) = self.sync_events().await {
                        warn!("Periodic event sync failed: {}", e);
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        info!("Received command: {} {:?}", command.name, command.args);
                        match execute_command(&command).await {
                            Ok(output) => {
                                info!("Command executed successfully. Output: {}", output);
                            }
                            Err(e) => error!("Error executing command: {}", e),
                        }
                    }
                    None => {
                        warn!("Command channel closed, stopping daemon loop");
                        break;
                    }
                },
                event = monitor_events.recv() => match event {
                    Some(event) => self.observe(event),
                    None => {
                        warn!("Monitor event channel closed, stopping daemon loop");
                        break;
                    }
                },
            }
        }

        self.monitor.stop().await?;
        info!("Daemon stopped");
        Ok(())
    }

    /// Maintenance pass: pull the engine's current event list and hand each
    /// event to the store (ownership passes on insert).
    async fn sync_events(&self) -> Result<()> {
        let events = self.monitor.file_events().await?;
        let count = events.len();
        for event in events {
            self.store.insert(event).await?;
        }
        debug!("Synced {} file events to store", count);
        Ok(())
    }

    fn observe(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Restarted { attempts } => {
                info!(
                    "Engine restarted after fault (failed attempts: {})",
                    attempts
                );
            }
            MonitorEvent::EngineExited { code } => {
                error!("Engine exited unexpectedly (code: {:?})", code);
            }
            MonitorEvent::SupervisionExhausted { retries } => {
                error!(
                    "Engine supervision exhausted after {} restart attempts; \
                     event queries will fail until a fresh restart succeeds",
                    retries
                );
            }
        }
    }
}

/// Execute one operator command, capturing combined stdout/stderr.
///
/// Failure bundles the exit error with whatever output was captured, so
/// nothing is silently swallowed.
pub async fn execute_command(command: &Command) -> Result<String> {
    let output = OsCommand::new(&command.name)
        .args(&command.args)
        .output()
        .await
        .map_err(|e| Error::CommandFailed {
            status: e.to_string(),
            output: String::new(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = clip_output(combined);

    if !output.status.success() {
        return Err(Error::CommandFailed {
            status: output.status.to_string(),
            output: combined,
        });
    }

    Ok(combined)
}

fn clip_output(mut output: String) -> String {
    if output.len() <= OUTPUT_LIMIT {
        return output;
    }
    let mut end = OUTPUT_LIMIT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use fimtrack_core::events::{FileEvent, FileOperation};
    use fimtrack_monitor::{MonitorState, Row};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_queue_preserves_fifo_order() {
        let (queue, mut rx) = CommandQueue::bounded(10);

        for name in ["a", "b", "c"] {
            queue
                .try_enqueue(Command {
                    name: name.to_string(),
                    args: vec![],
                })
                .unwrap();
        }

        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert_eq!(rx.try_recv().unwrap().name, "b");
        assert_eq!(rx.try_recv().unwrap().name, "c");
    }

    #[test]
    fn test_queue_full_reports_backpressure() {
        let (queue, _rx) = CommandQueue::bounded(1);

        queue
            .try_enqueue(Command {
                name: "a".to_string(),
                args: vec![],
            })
            .unwrap();

        let result = queue.try_enqueue(Command {
            name: "b".to_string(),
            args: vec![],
        });
        assert!(matches!(result, Err(Error::QueueFull)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_command_captures_output() {
        let output = execute_command(&Command {
            name: "echo".to_string(),
            args: vec!["hello".to_string()],
        })
        .await
        .unwrap();

        assert_eq!(output, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_command_failure_bundles_output() {
        let result = execute_command(&Command {
            name: "cat".to_string(),
            args: vec!["/definitely/not/a/file".to_string()],
        })
        .await;

        match result {
            Err(Error::CommandFailed { status, output }) => {
                assert!(status.contains("1"), "unexpected status: {}", status);
                assert!(
                    output.contains("No such file"),
                    "stderr should be captured: {}",
                    output
                );
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_clip_output_respects_char_boundaries() {
        let long = "é".repeat(OUTPUT_LIMIT);
        let clipped = clip_output(long);
        assert!(clipped.len() <= OUTPUT_LIMIT);
        assert!(clipped.chars().all(|c| c == 'é'));
    }

    /// Monitor stub: a fixed event list, bookkeeping for start/stop.
    struct StubMonitor {
        started: AtomicBool,
        stopped: AtomicBool,
    }

    impl StubMonitor {
        fn new() -> Self {
            Self {
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Monitor for StubMonitor {
        async fn start(&self, _shutdown: CancellationToken) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn query(&self, _statement: &str) -> Result<Vec<Row>> {
            Ok(vec![])
        }

        async fn file_events(&self) -> Result<Vec<FileEvent>> {
            // Fixed timestamp: identical across ticks, so the store's
            // upsert keeps exactly one copy
            Ok(vec![FileEvent {
                path: "/tmp/stub.txt".to_string(),
                operation: FileOperation::Modified,
                timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            }])
        }

        fn state(&self) -> MonitorState {
            MonitorState::Running
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_daemon_executes_commands_in_order_and_syncs_events() {
        let temp = tempfile::tempdir().unwrap();
        let out_file = temp.path().join("order.txt");

        let monitor = Arc::new(StubMonitor::new());
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let daemon = Daemon::new(
            monitor.clone(),
            store.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        let (queue, cmd_rx) = CommandQueue::bounded(10);
        let (_event_tx, event_rx) = mpsc::channel(8);

        for tag in ["A", "B", "C"] {
            queue
                .try_enqueue(Command {
                    name: "sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        format!("echo {} >> {}", tag, out_file.display()),
                    ],
                })
                .unwrap();
        }

        let handle = tokio::spawn(async move { daemon.run(cmd_rx, event_rx).await });

        // Give the loop time to drain the queue and tick at least once
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon should stop promptly")
            .expect("daemon task should not panic")
            .expect("daemon run should succeed");

        assert!(monitor.started.load(Ordering::SeqCst));
        assert!(monitor.stopped.load(Ordering::SeqCst));

        let order = std::fs::read_to_string(&out_file).unwrap();
        assert_eq!(order, "A\nB\nC\n");

        let stored = store.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].path, "/tmp/stub.txt");
    }
}
