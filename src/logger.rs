//! Kernel-style logging for the storage subsystem.
//!
//! The `kinfo!`/`kwarn!`/`kerror!`/`kdebug!` macros format in place and hand
//! the line to whatever sink the host installed; nothing is buffered here.
//! Level filtering is a single atomic so the hot paths stay cheap.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
            LogLevel::Debug => 3,
        }
    }
}

/// Host-installed output routine. Receives the level and the fully formatted
/// message body.
pub type LogSink = fn(LogLevel, fmt::Arguments);

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info.priority());
static SINK: Mutex<Option<LogSink>> = Mutex::new(None);

pub fn set_sink(sink: LogSink) {
    *SINK.lock() = Some(sink);
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn level_enabled(level: LogLevel) -> bool {
    level.priority() <= LOG_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments) {
    if !level_enabled(level) {
        return;
    }
    if let Some(sink) = *SINK.lock() {
        sink(level, args);
    }
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Debug, format_args!($($arg)*))
    };
}
