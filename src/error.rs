//! Error taxonomy (spec.md §7). The engine never throws: malformed
//! configuration is a `Result`, missing recordings are sentinel values, and
//! everything surfaced to the host also goes through the message callback.

use std::fmt;

/// Severity of a message surfaced to the host via `msg_cb`, mirroring the
/// C API's warning/fatal classification in spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Debug,
    Info,
    Warning,
    Fatal,
}

impl MessageLevel {
    pub fn as_log_level(self) -> log::Level {
        match self {
            MessageLevel::Debug => log::Level::Debug,
            MessageLevel::Info => log::Level::Info,
            MessageLevel::Warning => log::Level::Warn,
            MessageLevel::Fatal => log::Level::Error,
        }
    }
}

/// Library-level error enum. Hand-rolled `Display`/`Error` impls, matching
/// the teacher's preference for explicit structs/enums over a derive-macro
/// error crate (`robopoker` has no `thiserror` dependency; its own error
/// surfaces are plain enums or `anyhow`).
#[derive(Debug)]
pub enum SpadeError {
    /// An option-string token or CIDR literal could not be parsed.
    Configuration(String),
    /// A configuration problem severe enough that the host should stop.
    Fatal(String),
    /// Checkpoint I/O or format failure; recovery falls back to a blank
    /// engine rather than propagating, per spec.md §7, but the error is
    /// still surfaced so the host can log it.
    Recovery(String),
}

impl fmt::Display for SpadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpadeError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            SpadeError::Fatal(msg) => write!(f, "fatal configuration error: {msg}"),
            SpadeError::Recovery(msg) => write!(f, "checkpoint recovery failed: {msg}"),
        }
    }
}

impl std::error::Error for SpadeError {}

pub type SpadeResult<T> = Result<T, SpadeError>;
