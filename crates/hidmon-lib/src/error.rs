//! Unified error type for the hidmon-lib crate.
//!
//! [`MonitorError`] covers the failure kinds of the monitor: enumeration and
//! subscription problems reported by a platform bridge, lifecycle misuse
//! (`AlreadyRunning`, `Stopped`), and configuration errors. `From<io::Error>`
//! lets `?` carry OS errors out of the platform code.

use std::fmt;

/// Unified error type for hidmon-lib operations.
#[derive(Debug)]
pub enum MonitorError {
    /// A full device enumeration pass could not be started.
    Enumeration(String),
    /// The OS refused to register for hot-plug notifications.
    Subscription(String),
    /// Any other platform API failure.
    Platform(String),
    /// The operation has no implementation on this target.
    Unsupported(&'static str),
    /// Standard I/O error (sockets, config persistence).
    Io(std::io::Error),
    /// Configuration could not be turned into monitor options.
    Config(String),
    /// `start` was called on a monitor that already has a bridge running.
    AlreadyRunning,
    /// The monitor has been stopped and cannot be restarted.
    Stopped,
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Enumeration(e) => write!(f, "Enumeration failed: {e}"),
            MonitorError::Subscription(e) => write!(f, "Hot-plug subscription failed: {e}"),
            MonitorError::Platform(e) => write!(f, "Platform error: {e}"),
            MonitorError::Unsupported(what) => write!(f, "Not supported on this platform: {what}"),
            MonitorError::Io(e) => write!(f, "I/O error: {e}"),
            MonitorError::Config(e) => write!(f, "Config error: {e}"),
            MonitorError::AlreadyRunning => write!(f, "Monitor is already running"),
            MonitorError::Stopped => write!(f, "Monitor has been stopped"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Io(e)
    }
}

/// Crate-level Result alias using [`MonitorError`].
pub type Result<T> = std::result::Result<T, MonitorError>;
