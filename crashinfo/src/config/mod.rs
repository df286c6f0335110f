// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Program configuration.  Populated from command-line arguments and
//! configuration files; some fields are amended later from `/proc/<PID>`
//! when the victim's process directory is available.

mod parser;

pub use parser::{parse_file, parse_line, ConfigError};

use crate::log::{self, Level};
use crate::log_dbg;

/// How an output channel behaves when its expanded path already exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExistsPolicy {
    /// Open or create; writes go to the end.
    Append,
    /// Open or create, truncated to zero length.
    Overwrite,
    /// Create exclusively; on collision the output is silently discarded.
    Keep,
    /// Create exclusively; on collision re-render the template with an
    /// incremented counter, up to the configured ceiling.
    Sequence,
}

pub(crate) const EXISTS_NAMES: &[(&str, ExistsPolicy)] = &[
    ("append", ExistsPolicy::Append),
    ("overwrite", ExistsPolicy::Overwrite),
    ("keep", ExistsPolicy::Keep),
    ("sequence", ExistsPolicy::Sequence),
];

/// One executable mapping of the victim's address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Base virtual address the image is loaded at.
    pub addr: u64,
    /// Backing file.
    pub file: String,
}

/// Configuration of one output channel (core or info).
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Output path template, with `@` wildcards and strftime codes.
    pub output: Option<String>,
    /// Collision policy.
    pub exists: ExistsPolicy,
    /// Maximum sequence number for [`ExistsPolicy::Sequence`]; 0 or less
    /// retries without bound.
    pub exists_seq: i32,
    /// Create missing parent directories on demand.
    pub mkdir: bool,
    /// Commands the output is piped through, in order.
    pub filter: Vec<String>,
    /// Programs executed once the output is finalized.
    pub notify: Vec<String>,
}

impl OutputConfig {
    fn new(exists: ExistsPolicy) -> Self {
        Self {
            output: None,
            exists,
            exists_seq: 0,
            mkdir: false,
            filter: Vec::new(),
            notify: Vec::new(),
        }
    }
}

/// Per-sink log level thresholds; -1 disables a sink.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub stderr: i32,
    pub syslog: i32,
    pub info: i32,
}

/// Victim process information.  Normally read from `/proc/<PID>`, but every
/// field can be supplied up front for cores processed out of band.
#[derive(Debug, Clone)]
pub struct ProcConfig {
    /// Do not read anything from `/proc`.
    pub ignore: bool,
    /// Explicit `/proc/<PID>` directory path.
    pub path: Option<String>,
    /// Victim executable path.
    pub exe: Option<String>,
    /// Executable mappings of the victim address space.
    pub maps: Vec<Mapping>,
}

/// Which `/proc` files are snapshotted into the info document.
#[derive(Debug, Clone)]
pub struct ProcDumpConfig {
    /// Files relative to `/proc/<PID>`.
    pub root: Vec<String>,
    /// Files relative to each `/proc/<PID>/task/<TID>`.
    pub task: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Info output: the structured crash document goes there.
    pub info: OutputConfig,
    /// Core output: the core stream is copied there.
    pub core: OutputConfig,
    /// Buffer for backward seeks over the piped core, unwinder argument.
    pub core_buffer_size: i32,
    /// Per-thread call chain depth cap.
    pub backtrace_max_depth: i32,
    /// Programs notified with both the info and core filenames.
    pub info_core_notify: Vec<String>,
    pub log: LogConfig,
    pub proc: ProcConfig,
    pub proc_dump: ProcDumpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            info: OutputConfig::new(ExistsPolicy::Append),
            core: OutputConfig::new(ExistsPolicy::Keep),
            core_buffer_size: 4 * 1024 * 1024,
            backtrace_max_depth: 50,
            info_core_notify: Vec::new(),
            log: LogConfig {
                stderr: if cfg!(debug_assertions) {
                    Level::Debug as i32
                } else {
                    Level::Err as i32
                },
                syslog: log::LEVEL_NONE,
                info: Level::Notice as i32,
            },
            proc: ProcConfig {
                ignore: false,
                path: None,
                exe: None,
                maps: Vec::new(),
            },
            proc_dump: ProcDumpConfig {
                root: Vec::new(),
                task: Vec::new(),
            },
        }
    }
}

fn exists_name(policy: ExistsPolicy) -> &'static str {
    EXISTS_NAMES
        .iter()
        .find(|(_, p)| *p == policy)
        .map(|(n, _)| *n)
        .unwrap_or("UNKNOWN_VALUE")
}

fn level_name(level: i32) -> String {
    log::LEVEL_NAMES
        .iter()
        .find(|(_, l)| *l == level)
        .map(|(n, _)| (*n).to_string())
        .unwrap_or_else(|| format!("UNKNOWN_VALUE_{level}"))
}

fn log_multi(keyword: &str, values: &[String]) {
    if values.is_empty() {
        log_dbg!("{keyword} = ~");
    } else {
        for v in values {
            log_dbg!("{keyword} = {v}");
        }
    }
}

fn log_string(keyword: &str, value: &Option<String>) {
    log_dbg!("{keyword} = {}", value.as_deref().unwrap_or("~"));
}

impl Config {
    /// Dumps the effective configuration, one `keyword = value` line per
    /// entry, at debug level.
    pub fn log_debug(&self) {
        log_dbg!("info_exists = {}", exists_name(self.info.exists));
        log_dbg!("info_exists_seq = {}", self.info.exists_seq);
        log_multi("info_filter", &self.info.filter);
        log_dbg!("info_mkdir = {}", self.info.mkdir as i32);
        log_multi("info_notify", &self.info.notify);
        log_string("info_output", &self.info.output);
        log_dbg!("backtrace_max_depth = {}", self.backtrace_max_depth);
        log_dbg!("core_exists = {}", exists_name(self.core.exists));
        log_dbg!("core_exists_seq = {}", self.core.exists_seq);
        log_multi("core_filter", &self.core.filter);
        log_dbg!("core_mkdir = {}", self.core.mkdir as i32);
        log_multi("core_notify", &self.core.notify);
        log_string("core_output", &self.core.output);
        log_dbg!("core_buffer_size = {}", self.core_buffer_size);
        log_multi("info_core_notify", &self.info_core_notify);
        log_dbg!("log_info = {}", level_name(self.log.info));
        log_dbg!("log_syslog = {}", level_name(self.log.syslog));
        log_dbg!("log_stderr = {}", level_name(self.log.stderr));
        log_dbg!("proc_ignore = {}", self.proc.ignore as i32);
        log_string("proc_path", &self.proc.path);
        log_string("proc_exe", &self.proc.exe);
        if self.proc.maps.is_empty() {
            log_dbg!("proc_maps = ~");
        } else {
            for map in &self.proc.maps {
                log_dbg!("proc_maps = {:#x}:{}", map.addr, map.file);
            }
        }
        log_multi("proc_dump_root", &self.proc_dump.root);
        log_multi("proc_dump_task", &self.proc_dump.task);
    }
}
