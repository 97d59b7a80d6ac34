//! Routing guest output and SQLite diagnostics into `tracing`.
//!
//! Guest writes to fd 1 and 2 and messages reported through
//! `sqlite3_config(SQLITE_CONFIG_LOG)` both end up here. Each line is emitted
//! under the `guest` target with `guest_log = true` so a subscriber can filter
//! guest output apart from host diagnostics.

use tracing::{debug, error, info, warn};

/// `SQLITE_NOTICE` primary result code.
pub const SQLITE_NOTICE: i32 = 27;

/// `SQLITE_WARNING` primary result code.
pub const SQLITE_WARNING: i32 = 28;

/// Severity of a guest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Informational.
    Info,
    /// Something worth a look.
    Warn,
    /// A failure.
    Error,
}

/// Standard stream a guest wrote to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStream {
    /// fd 1.
    Stdout,
    /// fd 2.
    Stderr,
}

impl GuestStream {
    /// Level guest output on this stream is logged at.
    pub fn level(self) -> LogLevel {
        match self {
            GuestStream::Stdout => LogLevel::Info,
            GuestStream::Stderr => LogLevel::Warn,
        }
    }

    fn name(self) -> &'static str {
        match self {
            GuestStream::Stdout => "stdout",
            GuestStream::Stderr => "stderr",
        }
    }
}

/// Emits guest-originated messages.
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "guest", guest_log = true, "{}", message),
            LogLevel::Info => info!(target: "guest", guest_log = true, "{}", message),
            LogLevel::Warn => warn!(target: "guest", guest_log = true, "{}", message),
            LogLevel::Error => error!(target: "guest", guest_log = true, "{}", message),
        }
    }

    /// Log raw bytes written to a standard stream, one event per line.
    ///
    /// Invalid UTF-8 is replaced. Returns the number of lines emitted.
    pub fn log_stream(stream: GuestStream, data: &[u8]) -> usize {
        let text = String::from_utf8_lossy(data);
        let mut lines = 0;
        for line in split_lines(&text) {
            let level = stream.level();
            match level {
                LogLevel::Info => info!(target: "guest", guest_log = true, stream = stream.name(), "{}", line),
                _ => warn!(target: "guest", guest_log = true, stream = stream.name(), "{}", line),
            }
            lines += 1;
        }
        lines
    }

    /// Log a message reported by SQLite's error log.
    pub fn log_sqlite(error_code: i32, message: &str) {
        let level = level_from_result_code(error_code);
        match level {
            LogLevel::Debug => debug!(target: "guest", guest_log = true, error_code, "{}", message),
            LogLevel::Info => info!(target: "guest", guest_log = true, error_code, "{}", message),
            LogLevel::Warn => warn!(target: "guest", guest_log = true, error_code, "{}", message),
            LogLevel::Error => error!(target: "guest", guest_log = true, error_code, "{}", message),
        }
    }
}

/// Lines of `text`, without terminators; a trailing empty line is dropped.
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|line| !line.is_empty())
}

/// Map an SQLite result code to a log level.
///
/// Extended codes are reduced to their primary code first.
pub fn level_from_result_code(code: i32) -> LogLevel {
    match code & 0xff {
        SQLITE_NOTICE => LogLevel::Info,
        SQLITE_WARNING => LogLevel::Warn,
        _ => LogLevel::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_result_code() {
        assert_eq!(level_from_result_code(SQLITE_NOTICE), LogLevel::Info);
        assert_eq!(level_from_result_code(SQLITE_WARNING), LogLevel::Warn);
        // SQLITE_NOTICE_RECOVER_WAL
        assert_eq!(level_from_result_code(SQLITE_NOTICE | (1 << 8)), LogLevel::Info);
        assert_eq!(level_from_result_code(1), LogLevel::Error);
        assert_eq!(level_from_result_code(14), LogLevel::Error);
    }

    #[test]
    fn test_stream_levels() {
        assert_eq!(GuestStream::Stdout.level(), LogLevel::Info);
        assert_eq!(GuestStream::Stderr.level(), LogLevel::Warn);
    }

    #[test]
    fn test_log_stream_splits_lines() {
        assert_eq!(LoggingHost::log_stream(GuestStream::Stdout, b"one\ntwo\r\nthree\n"), 3);
        assert_eq!(LoggingHost::log_stream(GuestStream::Stderr, b"\n\n"), 0);
        assert_eq!(LoggingHost::log_stream(GuestStream::Stderr, b"\xffpartial"), 1);
    }
}
