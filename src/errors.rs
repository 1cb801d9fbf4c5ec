//! Error types shared across the daemon, launcher, and client.
//!
//! Every failure mode maps onto a small non-negative integer from the
//! host-shared error-code space, so both sides of the transport interpret
//! result codes identically. [`IcaError::code`] performs that mapping.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, IcaError>;

/// Success code shared with the host side.
pub const ERROR_SUCCESS: i32 = 0;
/// File not found.
pub const ERROR_FILE_NOT_FOUND: i32 = 2;
/// Bad environment: a pipe or channel could not be opened.
pub const ERROR_BAD_ENVIRONMENT: i32 = 9;
/// Bad format: a launcher reply frame could not be decoded.
pub const ERROR_BAD_FORMAT: i32 = 11;
/// No more files: the event loop lost one of its input sources.
pub const ERROR_NO_MORE_FILES: i32 = 18;
/// Bad command: unparseable request, or command rejected by the launcher.
pub const ERROR_BAD_COMMAND: i32 = 22;
/// Invalid parameter in an otherwise well-formed request.
pub const ERROR_INVALID_PARAMETER: i32 = 87;
/// Process not found: kill with nothing tracked, or a detach failure.
pub const ERROR_PROC_NOT_FOUND: i32 = 127;
/// Resource busy: the single asynchronous task slot is occupied.
pub const ERROR_BUSY: i32 = 170;

/// Sentinel "no process" id returned when a task could not be started.
pub const ERROR_PID: i32 = -1;

/// Crate error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum IcaError {
    /// A pipe, channel, or device could not be opened, or the daemonized
    /// entry function failed in a way that leaves the process unusable.
    BadEnvironment(String),
    /// A launcher wire frame violated the protocol.
    BadFormat(String),
    /// The event loop lost an input source it cannot run without.
    NoMoreFiles(String),
    /// A request or launcher submission could not be understood.
    BadCommand(String),
    /// A constructor invariant or request parameter was violated.
    InvalidParameter(String),
    /// A process could not be created or was not there to signal.
    ProcNotFound(String),
    /// The single asynchronous task slot is already occupied.
    Busy(String),
    /// File-system or I/O operation failure outside the coded taxonomy.
    Io(String),
}

impl IcaError {
    /// Numeric error code shared with the host side.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::BadEnvironment(_) | Self::Io(_) => ERROR_BAD_ENVIRONMENT,
            Self::BadFormat(_) => ERROR_BAD_FORMAT,
            Self::NoMoreFiles(_) => ERROR_NO_MORE_FILES,
            Self::BadCommand(_) => ERROR_BAD_COMMAND,
            Self::InvalidParameter(_) => ERROR_INVALID_PARAMETER,
            Self::ProcNotFound(_) => ERROR_PROC_NOT_FOUND,
            Self::Busy(_) => ERROR_BUSY,
        }
    }

    /// Message text without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::BadEnvironment(msg)
            | Self::BadFormat(msg)
            | Self::NoMoreFiles(msg)
            | Self::BadCommand(msg)
            | Self::InvalidParameter(msg)
            | Self::ProcNotFound(msg)
            | Self::Busy(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl Display for IcaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadEnvironment(msg) => write!(f, "bad environment: {msg}"),
            Self::BadFormat(msg) => write!(f, "bad format: {msg}"),
            Self::NoMoreFiles(msg) => write!(f, "no more files: {msg}"),
            Self::BadCommand(msg) => write!(f, "bad command: {msg}"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::ProcNotFound(msg) => write!(f, "process not found: {msg}"),
            Self::Busy(msg) => write!(f, "busy: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for IcaError {}

impl From<std::io::Error> for IcaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for IcaError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidParameter(format!("invalid config: {err}"))
    }
}
