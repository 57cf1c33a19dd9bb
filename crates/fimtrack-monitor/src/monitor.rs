//! Monitor capability trait and shared types
//!
//! The daemon and the HTTP layer depend only on this interface; the
//! subprocess-backed client in [`crate::osquery`] is the concrete backend
//! shipped here, with filesystem-watch style backends living elsewhere.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fimtrack_core::error::Result;
use fimtrack_core::events::FileEvent;

/// One decoded result row: a string-keyed map, exactly as the engine
/// reports it on the wire.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a supervised engine instance.
///
/// Mutated only by the supervisor's own control flow; external readers get
/// eventual visibility, which is enough for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    NotStarted,
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

/// Out-of-band notifications surfaced to the daemon
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// The engine process died without a recognized fault signature
    EngineExited { code: Option<i32> },
    /// A supervised restart succeeded after `attempts` failed tries
    Restarted { attempts: u32 },
    /// The restart budget is spent; operator intervention required
    SupervisionExhausted { retries: u32 },
}

/// Capability set shared by all event-source backends
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Start the backend. The cancellation token aborts a startup still
    /// waiting for the engine's ready signal.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Stop the backend. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Run one statement against the backend and return the decoded rows.
    ///
    /// Fails with `NotRunning` outside the `Running` state instead of
    /// blocking.
    async fn query(&self, statement: &str) -> Result<Vec<Row>>;

    /// All file events currently reported by the backend
    async fn file_events(&self) -> Result<Vec<FileEvent>>;

    /// Current lifecycle state (eventually consistent)
    fn state(&self) -> MonitorState;
}
