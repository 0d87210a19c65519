//! Unified logging setup for onionp2p binaries and tests.
//!
//! ```no_run
//! use onionp2p_logging::{init, LogLevel};
//!
//! init(LogLevel::Info);
//! ```
//!
//! The `RUST_LOG` environment variable, when set, overrides the level
//! passed here.

use tracing_subscriber::EnvFilter;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Info, warnings, and errors (default)
    #[default]
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    /// Map a CLI verbosity count onto a level: `0` → info, `1` → debug,
    /// anything more → trace.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Initialize logging with the specified level.
///
/// # Panics
///
/// Panics if a subscriber is already set. Use [`try_init`] to handle that
/// case (tests initialize repeatedly).
pub fn init(level: LogLevel) {
    try_init(level).expect("failed to initialize logging");
}

/// Try to initialize logging, returning an error if already initialized.
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbosity(10), LogLevel::Trace);
    }

    #[test]
    fn test_default_level() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_as_str() {
        assert_eq!(LogLevel::Error.as_str(), "error");
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }
}
