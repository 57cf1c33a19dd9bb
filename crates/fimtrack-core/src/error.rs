//! Application error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────
    // Engine Lifecycle Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Query engine binary not found. Ensure 'osqueryi' is in your PATH.")]
    EngineNotFound,

    #[error("Failed to spawn query engine: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Query engine exited before signaling ready (code: {code:?})")]
    EngineExitedEarly { code: Option<i32> },

    #[error("Engine startup cancelled")]
    Cancelled,

    #[error("Supervision exhausted after {retries} restart attempts")]
    SupervisionExhausted { retries: u32 },

    // ─────────────────────────────────────────────────────────────
    // Query Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Query engine is not running")]
    NotRunning,

    #[error("Failed to write query to engine: {reason}")]
    WriteFailed { reason: String },

    #[error("Failed to decode engine response: {reason}")]
    DecodeFailed { reason: String },

    #[error("Timed out waiting for engine response")]
    QueryTimeout,

    // ─────────────────────────────────────────────────────────────
    // Command Execution Errors
    // ─────────────────────────────────────────────────────────────
    #[error("command execution failed: {status}, output: {output}")]
    CommandFailed { status: String, output: String },

    #[error("Command queue is full")]
    QueueFull,

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn process_spawn(reason: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            reason: reason.into(),
        }
    }

    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }

    pub fn decode_failed(reason: impl Into<String>) -> Self {
        Self::DecodeFailed {
            reason: reason.into(),
        }
    }

    /// Check if this error leaves the engine unusable until a restart succeeds
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::EngineNotFound
                | Error::ProcessSpawn { .. }
                | Error::EngineExitedEarly { .. }
                | Error::SupervisionExhausted { .. }
        )
    }
}
