//! Logging setup
//!
//! The client logs through `tracing`. The same level also picks the
//! verbosity of the device server, which spells its levels differently.

use tracing_subscriber::{fmt, EnvFilter};

/// Log level configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Per-chunk stream and control activity
    Trace,
    /// Handshake steps and teardown details
    Debug,
    /// Session lifecycle
    #[default]
    Info,
    /// Recoverable failures
    Warn,
    /// Errors only
    Error,
}

impl LogLevel {
    fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Picks a level from a verbosity count (`-v`, `-vv`, ...)
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Level name passed on the server command line
    pub fn server_level(&self) -> &'static str {
        match self {
            LogLevel::Trace => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parses a server level name
    pub fn from_server_level(name: &str) -> Option<Self> {
        match name {
            "verbose" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Installs the global subscriber
///
/// `RUST_LOG` overrides `level`. If a subscriber is already installed it
/// is kept.
///
/// # Examples
///
/// ```no_run
/// use droid_mirror::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::from_verbosity(1));
/// ```
pub fn init_logging(level: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("droid_mirror={}", level.as_filter_str())));

    // Decode worker lines are told apart by thread name
    let installed = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(5), LogLevel::Trace);
        assert_eq!(LogLevel::default().as_filter_str(), "info");
    }

    #[test]
    fn test_server_level_names() {
        assert_eq!(LogLevel::Trace.server_level(), "verbose");
        assert_eq!(LogLevel::Trace.as_filter_str(), "trace");
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::from_server_level(level.server_level()), Some(level));
        }
        assert_eq!(LogLevel::from_server_level("trace"), None);
    }

    #[test]
    fn test_init_twice() {
        init_logging(LogLevel::Warn);
        init_logging(LogLevel::Debug);
    }
}
