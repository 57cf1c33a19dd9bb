//! Core domain types for the file-integrity monitoring agent
//!
//! Shared between the monitor crate (engine supervision) and the daemon
//! binary: the error taxonomy, file-event model, and logging bootstrap.

pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;

pub use error::{Error, Result};
pub use events::{FileEvent, FileOperation};
