// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The info document: a sequence of whitespace-significant records
//! describing the crash, written to the info output alongside the saved
//! core.  All writes funnel through [`InfoSink`], which both the emitter
//! (on the unwinder thread) and the logger (on the pipeline thread) lock
//! per record.

use crate::config::Mapping;
use crate::proc::{PidMap, ProcDir};
use crate::unwinder::Unwinder;
use crate::{log_err, log_warn};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Info output buffer size.
const OUT_BUFSIZE: usize = 64 * 1024;

const TID_SEPARATOR: &str =
    "--------------------------------------------------";

#[derive(Default)]
struct SinkInner {
    writer: Option<BufWriter<File>>,
    /// First write error observed; reported when the stream is finished.
    error: Option<io::Error>,
}

/// Shared handle to the info output.  Cheap to clone; all access is behind
/// one lock so records and log comments never interleave mid-line.
///
/// Callers must not log from inside an [`InfoSink::emit`] closure: the
/// logger takes this same lock, which is not reentrant.
#[derive(Clone, Default)]
pub struct InfoSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl InfoSink {
    /// A sink with no output attached; writes are dropped.
    pub fn closed() -> Self {
        Self::default()
    }

    /// Attaches the opened info output.
    pub fn attach(&self, file: File) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.writer = Some(BufWriter::with_capacity(OUT_BUFSIZE, file));
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().map(|i| i.writer.is_some()).unwrap_or(false)
    }

    /// Runs one composite write under the sink lock.  A closed sink is a
    /// no-op; the first failure is remembered and reported at the end of
    /// the stream, the way a stdio error flag would be.
    pub fn emit(&self, f: impl FnOnce(&mut dyn Write) -> io::Result<()>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let inner = &mut *inner;
        if let Some(writer) = inner.writer.as_mut() {
            if let Err(e) = f(writer) {
                inner.error.get_or_insert(e);
            }
        }
    }

    /// Flushes and syncs the stream, reporting any pending error.  EPIPE
    /// means a filter stopped reading and only warrants a warning; EROFS
    /// and EINVAL from fsync mean the destination cannot sync at all.
    pub fn flush_report(&self) {
        let (sticky, flush_err, sync_err) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let inner = &mut *inner;
            let Some(writer) = inner.writer.as_mut() else {
                return;
            };
            let flush_err = writer.flush().err();
            let sync_err = writer.get_ref().sync_all().err();
            (inner.error.take(), flush_err, sync_err)
        };
        report_stream_errors(sticky, flush_err, sync_err);
    }

    /// Flushes, syncs and closes the output.
    pub fn close(&self) {
        let (sticky, flush_err, sync_err) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let inner = &mut *inner;
            let Some(mut writer) = inner.writer.take() else {
                return;
            };
            let flush_err = writer.flush().err();
            let sync_err = writer.get_ref().sync_all().err();
            (inner.error.take(), flush_err, sync_err)
        };
        report_stream_errors(sticky, flush_err, sync_err);
    }
}

fn report_stream_errors(
    sticky: Option<io::Error>,
    flush_err: Option<io::Error>,
    sync_err: Option<io::Error>,
) {
    // Logging happens after the sink lock is released; see InfoSink::emit.
    for e in sticky.into_iter().chain(flush_err) {
        if e.raw_os_error() == Some(libc::EPIPE) {
            log_warn!("Info stream truncated");
        } else {
            log_err!("Failed flushing the info stream: {e}");
        }
    }
    if let Some(e) = sync_err {
        if !matches!(e.raw_os_error(), Some(libc::EROFS) | Some(libc::EINVAL)) {
            log_err!("Failed synchronizing the info stream: {e}");
        }
    }
}

/// Escapes a byte string for a double-quoted value: `\n`, `\t`, `\r`,
/// `\\` and `\"` by name, printable ASCII literally, anything else as
/// `\xHH`.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Writes a double-quoted, escaped value.
pub fn write_quoted(w: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    write!(w, "\"{}\"", escape(bytes))
}

/// Up to `n` spaces, saturating at the widest indent used by the document.
pub(crate) fn spaces(n: usize) -> &'static str {
    const SP: &str = "                       ";
    &SP[..n.min(SP.len())]
}

/// Everything the info emitter and the unwinder need once outputs are open.
/// Built by the pipeline after the `/proc` stage and published to the
/// unwinder thread through a write-once cell.
pub struct DumpContext {
    pub start_utc: DateTime<Utc>,
    pub start_instant: Instant,
    pub exe: Option<String>,
    pub mappings: Vec<Mapping>,
    pub proc_dir: Option<ProcDir>,
    pub proc_ignore: bool,
    pub dump_root: Vec<String>,
    pub dump_task: Vec<String>,
    pub backtrace_max_depth: i32,
    pub pid_map: PidMap,
}

/// Reads and splits `/proc/<PID>/cmdline`: arguments are NUL separated and
/// a trailing NUL ends the list.
fn read_cmdline(proc_dir: Option<&ProcDir>) -> Vec<Vec<u8>> {
    let Some(dir) = proc_dir else {
        return Vec::new();
    };
    let mut content = Vec::new();
    let Ok(mut file) = dir.open_file("cmdline") else {
        return Vec::new();
    };
    if file.read_to_end(&mut content).is_err() || content.is_empty() {
        return Vec::new();
    }
    let mut args: Vec<Vec<u8>> = content.split(|b| *b == 0).map(|a| a.to_vec()).collect();
    if args.last().map(|a| a.is_empty()).unwrap_or(false) {
        args.pop();
    }
    args
}

/// Emits one `proc_dump` record: each listed file's chomped contents as a
/// block scalar, or an inline comment when it cannot be opened.
pub(crate) fn proc_dump(
    sink: &InfoSink,
    dir: Option<&ProcDir>,
    files: &[String],
    ignore: bool,
    indent: usize,
) {
    if files.is_empty() {
        sink.emit(|w| writeln!(w, "{}proc_dump: ~", spaces(indent)));
        return;
    }
    if ignore {
        sink.emit(|w| writeln!(w, "{}proc_dump: ~ # proc_ignore = 1", spaces(indent)));
        return;
    }

    sink.emit(|w| writeln!(w, "{}proc_dump:", spaces(indent)));
    for name in files {
        // Read outside the sink lock; the logger takes the same lock.
        let content = match dir {
            Some(dir) => dir.open_file(name).and_then(|mut f| {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Ok(buf)
            }),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        };
        if let Err(e) = &content {
            log_err!("Can't open proc file '{name}': {e}");
        }

        sink.emit(|w| {
            write!(w, "{}", spaces(indent + 2))?;
            write_quoted(w, name.as_bytes())?;
            match &content {
                Ok(content) => {
                    writeln!(w, ": |")?;
                    let mut lines: Vec<&[u8]> = content.split(|b| *b == b'\n').collect();
                    if content.last() == Some(&b'\n') {
                        lines.pop();
                    }
                    for line in lines {
                        write!(w, "{}", spaces(indent + 4))?;
                        w.write_all(trim_trailing_whitespace(line))?;
                        writeln!(w)?;
                    }
                    Ok(())
                }
                Err(e) => writeln!(w, ": ~ # Can't open: {e}"),
            }
        });
    }
}

fn trim_trailing_whitespace(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && line[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &line[..end]
}

/// Writes the whole info document.  Runs on the unwinder thread once the
/// pipeline has opened the outputs.
pub fn info_dump(ctx: &DumpContext, sink: &InfoSink, unwinder: &mut dyn Unwinder) {
    sink.emit(|w| {
        writeln!(w, "---")?;
        writeln!(w, "datetime: {}", ctx.start_utc.format("%Y-%m-%dT%H:%M:%SZ"))
    });

    sink.emit(|w| {
        write!(w, "exe: ")?;
        write_quoted(w, ctx.exe.as_deref().unwrap_or_default().as_bytes())?;
        writeln!(w)
    });

    let cmdline = read_cmdline(ctx.proc_dir.as_ref());
    sink.emit(|w| {
        write!(w, "cmdline: [ ")?;
        for (i, arg) in cmdline.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            write_quoted(w, arg)?;
        }
        writeln!(w, " ]")
    });

    sink.emit(|w| {
        if ctx.mappings.is_empty() {
            writeln!(w, "executable_mappings: ~")
        } else {
            writeln!(w, "executable_mappings:")?;
            for map in &ctx.mappings {
                write!(w, "  0x{:016x}: ", map.addr)?;
                write_quoted(w, map.file.as_bytes())?;
                writeln!(w)?;
            }
            Ok(())
        }
    });

    proc_dump(
        sink,
        ctx.proc_dir.as_ref(),
        &ctx.dump_root,
        ctx.proc_ignore,
        0,
    );

    let mut task_dumper = |tid: i32| {
        sink.emit(|w| writeln!(w, "  - tid: {tid} # {TID_SEPARATOR}"));

        let host_tid = ctx.pid_map.map(tid);
        match ctx.proc_dir.as_ref() {
            Some(dir) => match dir.subdir(&format!("task/{host_tid}")) {
                Ok(task_dir) => {
                    proc_dump(sink, Some(&task_dir), &ctx.dump_task, ctx.proc_ignore, 4);
                }
                Err(e) => {
                    log_err!("Can't open '{}/task/{host_tid}': {e}", dir.path().display());
                }
            },
            None => log_err!("Can't open task directory for thread {tid}"),
        }
    };
    let _ = unwinder.dump(ctx, sink, &mut task_dumper);

    let elapsed = ctx.start_instant.elapsed();
    sink.emit(|w| {
        writeln!(
            w,
            "processing_time: {}.{:06}",
            elapsed.as_secs(),
            elapsed.subsec_micros()
        )
    });

    sink.flush_report();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reverses [`escape`]; the escape must be a bijection on byte strings.
    fn unescape(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c as u8);
                continue;
            }
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('r') => out.push(b'\r'),
                Some('\\') => out.push(b'\\'),
                Some('"') => out.push(b'"'),
                Some('x') => {
                    let hi = chars.next().unwrap().to_digit(16).unwrap();
                    let lo = chars.next().unwrap().to_digit(16).unwrap();
                    out.push((hi * 16 + lo) as u8);
                }
                other => panic!("bad escape: {other:?}"),
            }
        }
        out
    }

    #[test]
    fn test_escape_named_characters() {
        assert_eq!(escape(b"a\nb\tc\rd\\e\"f"), "a\\nb\\tc\\rd\\\\e\\\"f");
    }

    #[test]
    fn test_escape_unprintable_bytes() {
        assert_eq!(escape(&[0x00, 0x1f, 0x7f, 0xff]), "\\x00\\x1f\\x7f\\xff");
    }

    #[test]
    fn test_escape_printable_passthrough() {
        let s = "plain ASCII text 0123 {}[]";
        assert_eq!(escape(s.as_bytes()), s);
    }

    #[test]
    fn test_escape_roundtrip_identity() {
        let all: Vec<u8> = (0u8..=255).collect();
        assert_eq!(unescape(&escape(&all)), all);

        let tricky = b"mixed\n\t\"quotes\" and \\x00 literal text\x00\x01";
        assert_eq!(unescape(&escape(tricky)), tricky.to_vec());
    }

    #[test]
    fn test_write_quoted_wraps_in_quotes() {
        let mut out = Vec::new();
        write_quoted(&mut out, b"a\"b").unwrap();
        assert_eq!(out, b"\"a\\\"b\"");
    }

    #[test]
    fn test_spaces_saturates() {
        assert_eq!(spaces(0), "");
        assert_eq!(spaces(4), "    ");
        assert_eq!(spaces(500).len(), 23);
    }

    #[test]
    fn test_sink_emit_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        let sink = InfoSink::closed();
        // Writes before attach are dropped.
        sink.emit(|w| writeln!(w, "dropped"));
        assert!(!sink.is_open());

        sink.attach(File::create(&path).unwrap());
        assert!(sink.is_open());
        sink.emit(|w| writeln!(w, "---"));
        sink.emit(|w| writeln!(w, "datetime: now"));
        sink.close();
        assert!(!sink.is_open());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "---\ndatetime: now\n");
    }

    #[test]
    fn test_cmdline_split() {
        // No proc dir: empty list.
        assert!(read_cmdline(None).is_empty());
    }

    #[test]
    fn test_proc_dump_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        let sink = InfoSink::closed();
        sink.attach(File::create(&path).unwrap());
        proc_dump(&sink, None, &[], false, 2);
        sink.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "  proc_dump: ~\n");
    }

    #[test]
    fn test_proc_dump_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        let sink = InfoSink::closed();
        sink.attach(File::create(&path).unwrap());
        proc_dump(&sink, None, &["status".to_string()], true, 0);
        sink.close();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "proc_dump: ~ # proc_ignore = 1\n"
        );
    }

    #[test]
    fn test_proc_dump_contents_and_missing_file() {
        let proc_fixture = tempfile::tempdir().unwrap();
        std::fs::write(proc_fixture.path().join("status"), "Name:\tvi\nPid:\t7\n").unwrap();
        let proc_dir = ProcDir::open(proc_fixture.path()).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let path = out_dir.path().join("info");
        let sink = InfoSink::closed();
        sink.attach(File::create(&path).unwrap());
        proc_dump(
            &sink,
            Some(&proc_dir),
            &["status".to_string(), "missing".to_string()],
            false,
            0,
        );
        sink.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("proc_dump:\n"));
        assert!(content.contains("  \"status\": |\n    Name:\tvi\n    Pid:\t7\n"));
        assert!(content.contains("  \"missing\": ~ # Can't open:"));
    }
}
