//! Command validation and sanitization
//!
//! Last line of defense before subprocess execution: an untrusted operator
//! string either becomes a safe argument vector or is rejected. The base
//! command is checked against a strict allow-list (never a deny-list), and
//! every remaining token is reduced to a safe character set.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Rejection reasons, surfaced verbatim to the HTTP caller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("empty command")]
    EmptyCommand,
    #[error("base command not allowed")]
    CommandNotAllowed,
    #[error("invalid argument: potential path traversal")]
    PathTraversal,
}

/// Tokenization/allow-list flavor, fixed at compile time for the running
/// build but parameterized so both paths stay tested everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Posix,
    Windows,
}

impl TargetOs {
    pub const fn current() -> Self {
        if cfg!(windows) {
            TargetOs::Windows
        } else {
            TargetOs::Posix
        }
    }
}

/// Read-only commands permitted on POSIX hosts
const POSIX_COMMANDS: &[&str] = &["ls", "cat", "grep", "ps", "top", "df", "du"];

/// Read-only commands permitted on Windows hosts
const WINDOWS_COMMANDS: &[&str] = &[
    "dir",
    "type",
    "findstr",
    "tasklist",
    "systeminfo",
    "chkdsk",
];

/// Introspection commands permitted everywhere
const COMMON_COMMANDS: &[&str] = &["echo", "whoami", "hostname"];

/// Validate and sanitize a raw operator command for the running platform.
pub fn validate_and_sanitize(raw: &str) -> Result<Vec<String>, ValidateError> {
    validate_and_sanitize_for(raw, TargetOs::current())
}

/// Platform-explicit variant of [`validate_and_sanitize`].
///
/// Returns the token vector with arguments sanitized; the caller
/// reconstructs argv[0] + args from it.
pub fn validate_and_sanitize_for(raw: &str, os: TargetOs) -> Result<Vec<String>, ValidateError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidateError::EmptyCommand);
    }

    let mut tokens = tokenize(raw, os);
    if tokens.is_empty() {
        return Err(ValidateError::EmptyCommand);
    }

    let base = tokens[0].to_lowercase();
    if !is_allowed_command(&base, os) {
        return Err(ValidateError::CommandNotAllowed);
    }

    for token in tokens.iter_mut().skip(1) {
        *token = sanitize_argument(token)?;
    }

    Ok(tokens)
}

fn tokenize(raw: &str, os: TargetOs) -> Vec<String> {
    match os {
        TargetOs::Posix => raw.split_whitespace().map(str::to_string).collect(),
        TargetOs::Windows => split_quoted(raw),
    }
}

fn is_allowed_command(base: &str, os: TargetOs) -> bool {
    let platform = match os {
        TargetOs::Posix => POSIX_COMMANDS,
        TargetOs::Windows => WINDOWS_COMMANDS,
    };
    platform.contains(&base) || COMMON_COMMANDS.contains(&base)
}

fn sanitize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\-./\\]+").expect("sanitizer pattern is valid"))
}

/// Strip every character outside `[A-Za-z0-9_\-./\\]`, then reject the
/// result if a `..` sequence survives.
pub fn sanitize_argument(arg: &str) -> Result<String, ValidateError> {
    let sanitized = sanitize_re().replace_all(arg, "").into_owned();

    if sanitized.contains("..") {
        return Err(ValidateError::PathTraversal);
    }

    Ok(sanitized)
}

/// Quote-aware splitter for the Windows path: toggles on `"`, splits only
/// on unquoted spaces, and keeps quoted substrings (quotes included) as
/// single tokens.
fn split_quoted(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in raw.chars() {
        match c {
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
