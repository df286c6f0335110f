// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output channels: template expansion, collision handling, filter chain
//! attachment and channel teardown.

mod filter_chain;

pub use filter_chain::{build_filter_chain, FilterError, FilterProc};

use crate::config::{ExistsPolicy, OutputConfig};
use crate::info::InfoSink;
use crate::{log_crit, log_dbg, log_err, log_info, log_notice};
use chrono::{DateTime, Utc};
use crashinfo_common::unix_utils::{open_devnull, spawn_process, PreparedCommand};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{mkdir, pipe2};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

/// Longest path the expander will produce, NUL included.
const PATH_MAX: usize = 4096;

const ESC: char = '@';

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("No output path configured")]
    NotConfigured,
    #[error("Output filename '{0}' is not a full path")]
    NotAbsolute(String),
    #[error("Can't apply time format in '{0}'")]
    TimeFormat(String),
    #[error("Expanded output filename '{0}' is too long")]
    PathTooLong(String),
    #[error("Filename sequence limit reached")]
    SequenceExhausted,
    #[error("Can't create directory '{path}': {source}")]
    Mkdir {
        path: String,
        #[source]
        source: Errno,
    },
    #[error("Can't open '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Can't create filter pipe: {0}")]
    FilterPipe(#[source] nix::Error),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// A successfully opened channel: the descriptor writes go to, the concrete
/// filename, and the running filters to reap at close.
#[derive(Debug)]
pub struct OpenOutput {
    pub fd: OwnedFd,
    pub filename: String,
    pub filters: Vec<FilterProc>,
}

/// Decimal digit count, minimum 1.
fn intlen(value: u32) -> usize {
    if value < 10 {
        1
    } else {
        1 + intlen(value / 10)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Renders an output template: calendar-time codes first, then the `@`
/// wildcards.  `@@` is a literal `@`; a `@` is active only when the count
/// of consecutive `@`s before it is even, which consuming wildcards in
/// pairs produces naturally.
pub fn expand_path(
    template: &str,
    now: &DateTime<Utc>,
    exe: &str,
    counter: u32,
    ceiling: i32,
    policy: ExistsPolicy,
) -> Result<String, OutputError> {
    let mut formatted = String::new();
    if write!(formatted, "{}", now.format(template)).is_err() {
        log_crit!("Can't apply time format in '{template}'");
        return Err(OutputError::TimeFormat(template.to_string()));
    }

    let seq_len = if ceiling > 0 {
        intlen(ceiling as u32 - 1)
    } else {
        intlen(counter)
    };

    let mut out = String::with_capacity(formatted.len() + 32);
    let mut chars = formatted.chars();
    while let Some(c) = chars.next() {
        if c != ESC {
            out.push(c);
            continue;
        }
        match chars.next() {
            None | Some(ESC) => out.push(ESC),
            Some('Q') => {
                if policy != ExistsPolicy::Sequence {
                    log_info!(
                        "Sequence wild card in '{template}', but sequence mode is not used"
                    );
                }
                let _ = write!(out, "{counter:0seq_len$}");
            }
            Some('e') => out.push_str(basename(exe)),
            Some('E') => {
                for c in exe.chars() {
                    out.push(if c == '/' { '!' } else { c });
                }
            }
            Some(other) => {
                log_info!("Unknown wild card '@{other}' in '{template}'");
                out.push(ESC);
                out.push(other);
            }
        }
    }

    if out.len() >= PATH_MAX {
        log_crit!("Expanded output filename '{template}' is too long");
        return Err(OutputError::PathTooLong(template.to_string()));
    }
    Ok(out)
}

fn open_by_policy(path: &str, policy: ExistsPolicy) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).mode(0o600).custom_flags(libc::O_CLOEXEC);
    match policy {
        ExistsPolicy::Append => opts.append(true).create(true),
        ExistsPolicy::Overwrite => opts.truncate(true).create(true),
        ExistsPolicy::Keep | ExistsPolicy::Sequence => opts.create_new(true),
    };
    opts.open(path)
}

fn open_discard() -> Result<File, OutputError> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/null")
        .map_err(|source| {
            log_crit!("Can't open /dev/null: {source}");
            OutputError::Open {
                path: "/dev/null".to_string(),
                source,
            }
        })
}

/// Creates every missing directory of `path`'s parent chain, mode 0700.
fn make_path(path: &str) -> Result<(), OutputError> {
    let bytes = path.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b'/' {
            let dir = &path[..i];
            match mkdir(dir, Mode::S_IRWXU) {
                Ok(()) | Err(Errno::EEXIST) => {}
                Err(source) => {
                    log_crit!("Can't create directory '{dir}': {source}");
                    return Err(OutputError::Mkdir {
                        path: dir.to_string(),
                        source,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Opens one output channel: expands the template, applies the collision
/// policy, and attaches the filter chain.  On any failure no descriptor
/// and no filter child survives.
pub fn open_output(
    cfg: &OutputConfig,
    now: &DateTime<Utc>,
    exe: &str,
) -> Result<OpenOutput, OutputError> {
    let template = cfg.output.as_deref().ok_or(OutputError::NotConfigured)?;
    if !template.starts_with('/') {
        log_crit!("Output filename '{template}' is not a full path");
        return Err(OutputError::NotAbsolute(template.to_string()));
    }

    let mut mkdir_enabled = cfg.mkdir;
    let mut counter: u32 = 0;
    let (file, filename) = 'restart: loop {
        let path = expand_path(template, now, exe, counter, cfg.exists_seq, cfg.exists)?;
        log_dbg!("Expanded output: {path}");

        loop {
            match open_by_policy(&path, cfg.exists) {
                Ok(file) => break 'restart (file, path),
                Err(e)
                    if e.kind() == ErrorKind::AlreadyExists
                        && cfg.exists == ExistsPolicy::Keep =>
                {
                    log_notice!("File '{path}' already exists, ignoring the output");
                    break 'restart (open_discard()?, path);
                }
                Err(e)
                    if e.kind() == ErrorKind::AlreadyExists
                        && cfg.exists == ExistsPolicy::Sequence =>
                {
                    counter += 1;
                    if cfg.exists_seq > 0 && counter >= cfg.exists_seq as u32 {
                        log_crit!("Filename sequence limit reached");
                        return Err(OutputError::SequenceExhausted);
                    }
                    continue 'restart;
                }
                Err(e) if e.kind() == ErrorKind::NotFound && mkdir_enabled => {
                    make_path(&path)?;
                    mkdir_enabled = false;
                    // Retry the open exactly once with the directories made.
                }
                Err(source) => {
                    log_crit!("Can't open '{path}': {source}");
                    return Err(OutputError::Open { path, source });
                }
            }
        }
    };

    if cfg.filter.is_empty() {
        return Ok(OpenOutput {
            fd: file.into(),
            filename,
            filters: Vec::new(),
        });
    }

    let (pipe_r, pipe_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
        log_err!("Can't create filter pipe: {e}");
        OutputError::FilterPipe(e)
    })?;
    let filters = build_filter_chain(&cfg.filter, pipe_r, file.into())?;
    Ok(OpenOutput {
        fd: pipe_w,
        filename,
        filters,
    })
}

/// Waits for every filter in spawn order and logs how each ended.
pub fn reap_filters(filters: Vec<FilterProc>) {
    for filter in filters {
        match waitpid(filter.pid, None) {
            Ok(WaitStatus::Exited(_, 0)) => {
                log_dbg!("Filter '{}' ended successfully", filter.command);
            }
            Ok(WaitStatus::Exited(_, code)) => {
                log_err!("Filter '{}' failed with return code {code}", filter.command);
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                log_err!("Filter '{}' was terminated by signal {signal}", filter.command);
            }
            Ok(_) => {}
            Err(e) => {
                log_crit!("Waiting for filter '{}' failed: {e}", filter.command);
            }
        }
    }
}

/// Spawns one notify program with `/dev/null` on stdin and stdout and the
/// filenames substituted for `@1`/`@2`.  Notify programs are not awaited.
pub fn spawn_notify(command: &str, arg1: &str, arg2: Option<&str>) {
    let prepared = match PreparedCommand::new(command, Some(arg1), arg2) {
        Ok(p) => p,
        Err(e) => {
            log_crit!("Can't prepare notify program '{command}': {e}");
            return;
        }
    };
    let devnull = match open_devnull() {
        Ok(f) => f,
        Err(e) => {
            log_crit!("Can't open /dev/null: {e}");
            return;
        }
    };
    log_dbg!("Starting program '{command}'");
    if let Err(e) = spawn_process(&prepared, devnull.as_fd(), devnull.as_fd()) {
        log_crit!("Forking process '{command}' failed: {e}");
    }
}

/// Closes the core channel: sync, close, reap the filters in order, then
/// run the channel's notify programs with the concrete filename.
pub fn close_core_channel(cfg: &OutputConfig, channel: Option<OpenOutput>) {
    let Some(channel) = channel else { return };
    let file = File::from(channel.fd);
    // fsync on a filter pipe fails with EINVAL; both are best effort here.
    let _ = file.sync_all();
    drop(file);
    reap_filters(channel.filters);
    for command in &cfg.notify {
        spawn_notify(command, &channel.filename, None);
    }
}

/// Closes the info channel through its shared sink, then reaps and
/// notifies like the core channel.
pub fn close_info_channel(
    cfg: &OutputConfig,
    sink: &InfoSink,
    filename: Option<&str>,
    filters: Vec<FilterProc>,
) {
    sink.close();
    reap_filters(filters);
    if let Some(filename) = filename {
        for command in &cfg.notify {
            spawn_notify(command, filename, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::TimeZone;
    use crashinfo_common::unix_utils::write_some;
    use std::os::fd::AsFd;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2001, 12, 15, 2, 59, 43).unwrap()
    }

    fn core_cfg(template: &str, exists: ExistsPolicy) -> OutputConfig {
        let mut cfg = Config::default().core;
        cfg.output = Some(template.to_string());
        cfg.exists = exists;
        cfg
    }

    #[test]
    fn test_expand_literal_escape() {
        let path = expand_path("/a/@@b", &at(), "", 0, 0, ExistsPolicy::Keep).unwrap();
        assert_eq!(path, "/a/@b");
    }

    #[test]
    fn test_expand_escape_parity() {
        // Odd run of escapes: "@@" collapses, the rest starts a wildcard.
        let path = expand_path("/a/@@@e", &at(), "/usr/bin/foo", 0, 0, ExistsPolicy::Keep)
            .unwrap();
        assert_eq!(path, "/a/@foo");
        // Even run: two literals.
        let path = expand_path("/a/@@@@e", &at(), "/usr/bin/foo", 0, 0, ExistsPolicy::Keep)
            .unwrap();
        assert_eq!(path, "/a/@@e");
    }

    #[test]
    fn test_expand_executable_wildcards() {
        let exe = "/usr/bin/foo";
        assert_eq!(
            expand_path("/tmp/@e.core", &at(), exe, 0, 0, ExistsPolicy::Keep).unwrap(),
            "/tmp/foo.core"
        );
        assert_eq!(
            expand_path("/tmp/@E.core", &at(), exe, 0, 0, ExistsPolicy::Keep).unwrap(),
            "/tmp/!usr!bin!foo.core"
        );
    }

    #[test]
    fn test_expand_counter_widths() {
        // Ceiling chooses the zero-padding width.
        assert_eq!(
            expand_path("/c@Q", &at(), "", 2, 3, ExistsPolicy::Sequence).unwrap(),
            "/c2"
        );
        assert_eq!(
            expand_path("/c@Q", &at(), "", 2, 100, ExistsPolicy::Sequence).unwrap(),
            "/c02"
        );
        // No ceiling: width of the counter itself.
        assert_eq!(
            expand_path("/c@Q", &at(), "", 12, 0, ExistsPolicy::Sequence).unwrap(),
            "/c12"
        );
    }

    #[test]
    fn test_expand_unknown_wildcard_kept() {
        assert_eq!(
            expand_path("/a/@x", &at(), "", 0, 0, ExistsPolicy::Keep).unwrap(),
            "/a/@x"
        );
        assert_eq!(
            expand_path("/a/end@", &at(), "", 0, 0, ExistsPolicy::Keep).unwrap(),
            "/a/end@"
        );
    }

    #[test]
    fn test_expand_strftime_codes() {
        assert_eq!(
            expand_path("/var/crash/%Y-%m-%d/@e", &at(), "/bin/sh", 0, 0, ExistsPolicy::Keep)
                .unwrap(),
            "/var/crash/2001-12-15/sh"
        );
    }

    #[test]
    fn test_expand_too_long() {
        let exe = format!("/{}", "x".repeat(5000));
        assert!(matches!(
            expand_path("/tmp/@E", &at(), &exe, 0, 0, ExistsPolicy::Keep),
            Err(OutputError::PathTooLong(_))
        ));
    }

    #[test]
    fn test_open_requires_absolute_path() {
        let cfg = core_cfg("relative/path", ExistsPolicy::Keep);
        assert!(matches!(
            open_output(&cfg, &at(), ""),
            Err(OutputError::NotAbsolute(_))
        ));
    }

    #[test]
    fn test_open_overwrite_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core");
        std::fs::write(&path, "OLD DATA").unwrap();

        let cfg = core_cfg(path.to_str().unwrap(), ExistsPolicy::Overwrite);
        let out = open_output(&cfg, &at(), "").unwrap();
        assert_eq!(out.filename, path.to_str().unwrap());
        drop(out);
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn test_open_append_preserves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        std::fs::write(&path, "OLD").unwrap();

        let cfg = core_cfg(path.to_str().unwrap(), ExistsPolicy::Append);
        let out = open_output(&cfg, &at(), "").unwrap();
        write_some(out.fd.as_fd(), b"NEW").unwrap();
        drop(out);
        assert_eq!(std::fs::read(&path).unwrap(), b"OLDNEW");
    }

    #[test]
    fn test_open_keep_collision_discards_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core");
        std::fs::write(&path, "OLD").unwrap();

        let cfg = core_cfg(path.to_str().unwrap(), ExistsPolicy::Keep);
        let out = open_output(&cfg, &at(), "").unwrap();
        // The filename is still the collided path, but writes are discarded.
        assert_eq!(out.filename, path.to_str().unwrap());
        write_some(out.fd.as_fd(), b"NEW").unwrap();
        drop(out);
        assert_eq!(std::fs::read(&path).unwrap(), b"OLD");
    }

    #[test]
    fn test_open_sequence_skips_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/c@Q", dir.path().display());
        std::fs::write(dir.path().join("c0"), "").unwrap();
        std::fs::write(dir.path().join("c1"), "").unwrap();

        let mut cfg = core_cfg(&template, ExistsPolicy::Sequence);
        cfg.exists_seq = 3;
        let out = open_output(&cfg, &at(), "").unwrap();
        assert!(out.filename.ends_with("/c2"));
        drop(out);
        assert!(dir.path().join("c2").exists());
    }

    #[test]
    fn test_open_sequence_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/c@Q", dir.path().display());
        std::fs::write(dir.path().join("c0"), "").unwrap();
        std::fs::write(dir.path().join("c1"), "").unwrap();

        let mut cfg = core_cfg(&template, ExistsPolicy::Sequence);
        cfg.exists_seq = 2;
        assert!(matches!(
            open_output(&cfg, &at(), ""),
            Err(OutputError::SequenceExhausted)
        ));
    }

    #[test]
    fn test_open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/core");
        let mut cfg = core_cfg(path.to_str().unwrap(), ExistsPolicy::Overwrite);
        cfg.mkdir = true;
        let out = open_output(&cfg, &at(), "").unwrap();
        drop(out);
        assert!(path.exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("a")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_open_missing_directories_without_mkdir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/core");
        let cfg = core_cfg(path.to_str().unwrap(), ExistsPolicy::Overwrite);
        assert!(matches!(
            open_output(&cfg, &at(), ""),
            Err(OutputError::Open { .. })
        ));
    }

    #[test]
    fn test_open_with_filters_returns_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core");
        let mut cfg = core_cfg(path.to_str().unwrap(), ExistsPolicy::Overwrite);
        cfg.filter = vec!["cat".to_string()];

        let out = open_output(&cfg, &at(), "").unwrap();
        assert_eq!(out.filters.len(), 1);
        write_some(out.fd.as_fd(), b"DATA").unwrap();
        close_core_channel(&cfg, Some(out));
        assert_eq!(std::fs::read(&path).unwrap(), b"DATA");
    }

    #[test]
    fn test_notify_program_receives_filename() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let target = dir.path().join("core");
        std::fs::write(&target, "").unwrap();

        let mut cfg = core_cfg(target.to_str().unwrap(), ExistsPolicy::Overwrite);
        cfg.notify = vec![format!("cp @1 {}", marker.display())];
        let out = open_output(&cfg, &at(), "").unwrap();
        close_core_channel(&cfg, Some(out));

        // Notify programs are fire-and-forget; give this one a moment.
        for _ in 0..100 {
            if marker.exists() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("notify program did not run");
    }

    #[test]
    fn test_intlen() {
        assert_eq!(intlen(0), 1);
        assert_eq!(intlen(9), 1);
        assert_eq!(intlen(10), 2);
        assert_eq!(intlen(99), 2);
        assert_eq!(intlen(100), 3);
    }
}
