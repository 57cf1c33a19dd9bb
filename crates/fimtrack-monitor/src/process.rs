//! Engine subprocess management

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use fimtrack_core::prelude::*;

use crate::config::MonitorConfig;

/// Line the engine prints on its error stream once initialization is done
pub(crate) const READY_SIGNATURE: &str = "Osquery started successfully";

/// Line-oriented view of the engine's error stream
pub(crate) type StderrLines = Lines<BufReader<ChildStderr>>;

/// One live engine subprocess with its input/output pipes.
///
/// The pipes are handed out as plain fields: the supervisor serializes all
/// access behind its session lock, so no channel indirection is needed here.
pub(crate) struct EngineProcess {
    child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: BufReader<ChildStdout>,
}

impl EngineProcess {
    /// Spawn the engine wired to three pipes.
    ///
    /// A bare binary name is resolved on PATH; an explicit path is used
    /// as given.
    pub(crate) fn spawn(config: &MonitorConfig) -> Result<(Self, StderrLines)> {
        let binary = config.engine_binary();
        let resolved = if binary.components().count() > 1 {
            binary.to_path_buf()
        } else {
            which::which(binary).map_err(|_| Error::EngineNotFound)?
        };

        info!(
            "Spawning engine: {} {}",
            resolved.display(),
            config.engine_args().join(" ")
        );

        let mut child = Command::new(&resolved)
            .args(config.engine_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true) // cleanup if the supervisor is dropped mid-flight
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::EngineNotFound
                } else {
                    Error::process_spawn(e.to_string())
                }
            })?;

        info!("Engine process started with PID: {:?}", child.id());

        let stdin = child.stdin.take().expect("stdin was configured");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was configured"));
        let stderr = BufReader::new(child.stderr.take().expect("stderr was configured")).lines();

        Ok((
            Self {
                child,
                stdin,
                stdout,
            },
            stderr,
        ))
    }

    /// Scan the error stream for the ready signature, racing cancellation
    /// and early exit.
    ///
    /// On cancellation the process is killed before returning `Cancelled`;
    /// if the process dies first the exit code is reported via
    /// `EngineExitedEarly`.
    pub(crate) async fn wait_for_ready(
        &mut self,
        stderr: &mut StderrLines,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Startup cancelled, killing engine process");
                    self.kill().await;
                    return Err(Error::Cancelled);
                }
                status = self.child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    error!("Engine exited before signaling ready (code: {:?})", code);
                    return Err(Error::EngineExitedEarly { code });
                }
                line = stderr.next_line() => match line {
                    Ok(Some(line)) => {
                        debug!("engine stderr: {}", line);
                        if line.contains(READY_SIGNATURE) {
                            info!("Engine started successfully");
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        // Error stream closed: the process is exiting
                        let code = self.child.wait().await.ok().and_then(|s| s.code());
                        error!("Engine exited before signaling ready (code: {:?})", code);
                        return Err(Error::EngineExitedEarly { code });
                    }
                    Err(e) => return Err(Error::Io(e)),
                },
            }
        }
    }

    /// Forcefully terminate the process and reap it.
    ///
    /// The engine has no graceful shutdown protocol, so this is the only
    /// way down. Errors are logged, not propagated: a kill racing a
    /// natural exit is not a failure.
    pub(crate) async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill engine process: {}", e);
            }
        }
        match self.child.wait().await {
            Ok(status) => info!("Engine process terminated, exit status: {:?}", status),
            Err(e) => warn!("Error reaping engine process: {}", e),
        }
    }

    /// Wait for the process to exit and return its code.
    ///
    /// Used by the fault watcher after the error stream hits EOF.
    pub(crate) async fn wait_code(mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|s| s.code())
    }
}
