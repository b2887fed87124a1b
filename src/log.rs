//! Levelled file logging for the relay daemon.
//!
//! Worker output lines land here through [`crate::worker::FileLogSink`], interleaved
//! with supervisor events, so one file tells the whole story of a camera session.
//!
//! Log levels:
//! - ERROR: launch failures, relay read errors
//! - WARN: worker deaths, stale workers that ignored SIGTERM
//! - INFO: worker output, start/reconnect/shutdown
//! - DEBUG: liveness ticks, state transitions
//! - TRACE: per-line relay bookkeeping
//!
//! Debug mode can be enabled with `--debug` or `KVS_RELAY_DEBUG=1`.
//! Until [`init`] runs every call is a no-op.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

const DEBUG_ENV: &str = "KVS_RELAY_DEBUG";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Initialize logging to ~/.kvs-relay/kvs-relay.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging, honouring `KVS_RELAY_DEBUG` on top of the flag.
pub fn init_with_debug(debug: bool) {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".kvs-relay")) {
        init_at(&dir.join("kvs-relay.log"), debug);
    }
}

/// Initialize logging to an explicit file. Only the first call sets the path.
pub fn init_at(path: &Path, debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let level = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    set_level(level);

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    // Truncate on startup
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level (only written in debug mode).
#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
