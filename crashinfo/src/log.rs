// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message routing to three independently gated sinks: stderr, syslog and,
//! once it is open, the info stream.  Thresholds use syslog numbering
//! (lower = more severe); -1 disables a sink.  Thresholds live in atomics so
//! the pipeline and unwinder threads share them without locking.

use crate::config::LogConfig;
use crate::info::InfoSink;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicI32, Ordering::Relaxed};
use std::sync::Mutex;

/// Threshold value disabling a sink.
pub const LEVEL_NONE: i32 = -1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum Level {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

/// Symbolic names accepted by the `log_*` configuration options.
pub const LEVEL_NAMES: &[(&str, i32)] = &[
    ("none", LEVEL_NONE),
    ("emerg", Level::Emerg as i32),
    ("alert", Level::Alert as i32),
    ("crit", Level::Crit as i32),
    ("err", Level::Err as i32),
    ("warning", Level::Warning as i32),
    ("notice", Level::Notice as i32),
    ("info", Level::Info as i32),
    ("debug", Level::Debug as i32),
];

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Emerg => "EMRG: ",
            Level::Alert => "ALRT: ",
            Level::Crit => "CRIT: ",
            Level::Err => "ERR:  ",
            Level::Warning => "WARN: ",
            Level::Notice => "NOTI: ",
            Level::Info => "INFO: ",
            Level::Debug => "DBG:  ",
        }
    }
}

struct Logger {
    stderr: AtomicI32,
    syslog: AtomicI32,
    info: AtomicI32,
    info_sink: Mutex<Option<InfoSink>>,
}

static LOGGER: Logger = Logger {
    stderr: AtomicI32::new(if cfg!(debug_assertions) {
        Level::Debug as i32
    } else {
        Level::Err as i32
    }),
    syslog: AtomicI32::new(LEVEL_NONE),
    info: AtomicI32::new(Level::Notice as i32),
    info_sink: Mutex::new(None),
};

/// Connects to syslog.  Call once at startup, before any message may need
/// the sink.
pub fn open_syslog() {
    static IDENT: &std::ffi::CStr = c"crashinfo";
    // Safety: the identity string outlives the process, as openlog requires.
    unsafe {
        libc::openlog(
            IDENT.as_ptr(),
            libc::LOG_PID | libc::LOG_NDELAY,
            libc::LOG_DAEMON,
        );
    }
}

/// Applies the configured thresholds.
pub fn apply_log_config(config: &LogConfig) {
    LOGGER.stderr.store(config.stderr, Relaxed);
    LOGGER.syslog.store(config.syslog, Relaxed);
    LOGGER.info.store(config.info, Relaxed);
}

/// Routes log lines into the info stream once its output is open.  Lines are
/// written under the sink lock with a `# ` prefix so they stay valid
/// comments between document records.
pub fn attach_info_sink(sink: InfoSink) {
    if let Ok(mut slot) = LOGGER.info_sink.lock() {
        *slot = Some(sink);
    }
}

#[doc(hidden)]
pub fn logmsg(level: Level, args: fmt::Arguments<'_>) {
    let priority = level as i32;

    if LOGGER.stderr.load(Relaxed) >= priority {
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_all(level.prefix().as_bytes());
        let _ = stderr.write_fmt(args);
        let _ = stderr.write_all(b"\n");
    }

    if LOGGER.syslog.load(Relaxed) >= priority {
        if let Ok(message) = std::ffi::CString::new(fmt::format(args)) {
            // Safety: a constant "%s" format with a NUL-terminated argument.
            unsafe {
                libc::syslog(
                    priority,
                    c"%s".as_ptr(),
                    message.as_ptr(),
                );
            }
        }
    }

    if LOGGER.info.load(Relaxed) >= priority {
        let sink = LOGGER
            .info_sink
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        if let Some(sink) = sink {
            sink.emit(|w| {
                w.write_all(b"# ")?;
                w.write_all(level.prefix().as_bytes())?;
                w.write_fmt(args)?;
                w.write_all(b"\n")
            });
        }
    }
}

#[macro_export]
macro_rules! log_crit {
    ($($arg:tt)*) => { $crate::log::logmsg($crate::log::Level::Crit, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => { $crate::log::logmsg($crate::log::Level::Err, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log::logmsg($crate::log::Level::Warning, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => { $crate::log::logmsg($crate::log::Level::Notice, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log::logmsg($crate::log::Level::Info, format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! log_dbg {
    ($($arg:tt)*) => { $crate::log::logmsg($crate::log::Level::Debug, format_args!($($arg)*)) };
}
