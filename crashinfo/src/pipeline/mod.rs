// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The streaming pipeline: a single pass over the core arriving on stdin,
//! fanned out to the on-disk core output and to the unwinder thread.
//!
//! The kernel pipe delivers the core once and cannot be rewound, and the
//! unwinder needs enough of the file prefix to identify the victim PID
//! before `/proc/<PID>` can be opened.  The pipeline therefore primes the
//! unwinder with one buffer, non-blocking and with a bounded retry count,
//! so a pathological core that never yields a PID cannot deadlock the
//! drain.

use crate::config::Config;
use crate::info::{self, DumpContext, InfoSink};
use crate::output::{self, FilterProc, OpenOutput};
use crate::proc::{read_proc_info, PidMap, ProcDir};
use crate::unwinder;
use crate::{log, log_crit, log_dbg, log_err, log_warn};
use chrono::Utc;
use crashinfo_common::unix_utils::{read_fill, set_blocking, set_nonblocking, write_some};
use nix::fcntl::OFlag;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering::SeqCst};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Victim PID not yet known.
pub const PID_UNKNOWN: i32 = -1;
/// Victim PID resolution failed.
pub const PID_FAILED: i32 = -2;

/// One read from stdin during the priming phase.
const PRIME_BUF_SIZE: usize = 32 * 1024;
/// Consecutive fruitless feed attempts before priming gives up.
const PRIME_MAX_TRIES: u32 = 5;
/// Pause between feed attempts.
const PRIME_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Signals whose default action dumps core.
const CORE_SIGNALS: [Signal; 10] = [
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGSYS,
    Signal::SIGTRAP,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
];

extern "C" fn fatal_signal_handler(_signum: libc::c_int) {
    // Safety: _exit is async-signal-safe; nothing else may run here.
    unsafe { libc::_exit(2) }
}

/// Allocates the alternate signal stack with a guard page at its base.
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    let page_size = page_size::get();
    let stack_size = std::cmp::max(libc::SIGSTKSZ, 16 * page_size);
    let stackp = libc::mmap(
        std::ptr::null_mut(),
        stack_size + page_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != libc::MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, libc::PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: stack_size,
    };
    let rval = libc::sigaltstack(&stack, std::ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

/// Sets the core resource limit to zero and catches the core-generating
/// signals, so a crash while handling a crash cannot recurse.  The handler
/// exits with status 2 immediately; SIGPIPE is ignored so filter teardown
/// surfaces as EPIPE instead of killing the handler.
pub fn disable_core_generation() {
    if let Err(e) = setrlimit(Resource::RLIMIT_CORE, 0, 0) {
        log_warn!("Can't disable core dumps: {e}");
    }

    let mut flags = SaFlags::SA_ONSTACK;
    // Safety: this runs once, before any thread exists.
    if let Err(e) = unsafe { create_alt_stack() } {
        log_warn!("Can't configure alternative stack: {e}");
        flags = SaFlags::empty();
    }

    let action = SigAction::new(
        SigHandler::Handler(fatal_signal_handler),
        flags,
        SigSet::empty(),
    );
    for signal in CORE_SIGNALS {
        // Safety: the handler is async-signal-safe.
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            log_warn!("Can't change action of the signal {signal}: {e}");
        }
    }

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // Safety: ignoring a signal has no preconditions.
    let _ = unsafe { sigaction(Signal::SIGPIPE, &ignore) };
}

/// State shared between the pipeline thread and the unwinder thread.
struct Shared {
    /// Victim PID word: written at most once by the unwinder thread.
    pid: AtomicI32,
    /// Held by the pipeline thread until both outputs are open.
    output_ready: Mutex<()>,
    sink: InfoSink,
    /// Published by the pipeline thread before `output_ready` is released.
    dump_ctx: OnceLock<DumpContext>,
}

fn lock_output_ready(shared: &Shared) -> MutexGuard<'_, ()> {
    shared
        .output_ready
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_core_chunk(core: Option<&OpenOutput>, data: &[u8], failed: &mut bool) {
    let Some(out) = core else { return };
    if data.is_empty() {
        return;
    }
    let result = write_some(out.fd.as_fd(), data);
    let complete = matches!(&result, Ok(n) if *n == data.len());
    if !complete && !*failed {
        *failed = true;
        match result {
            Err(e) => log_warn!("Failed writing the core output: {e}"),
            Ok(n) => log_warn!("Short write on the core output: {n} of {} bytes", data.len()),
        }
    }
}

/// Runs the whole pipeline: unwinder thread launch, priming, the `/proc`
/// stage, output opening, the drain and shutdown.  `stdin` is the read
/// side of the kernel's core pipe.  Individual output failures disable
/// the affected channel and the run continues; the only hard failure is
/// not being able to create the unwinder thread.
pub fn run_pipeline(mut config: Config, stdin: OwnedFd) -> anyhow::Result<()> {
    let start_utc = Utc::now();
    let start_instant = Instant::now();

    log_dbg!("Configuration before reading /proc/<PID>:");
    config.log_debug();

    let shared = Arc::new(Shared {
        pid: AtomicI32::new(PID_UNKNOWN),
        output_ready: Mutex::new(()),
        sink: InfoSink::closed(),
        dump_ctx: OnceLock::new(),
    });
    log::attach_info_sink(shared.sink.clone());

    // Held until the outputs are open; the unwinder thread blocks on it
    // before writing anything.
    let guard = lock_output_ready(&shared);

    let mut unw_pipe_w: Option<OwnedFd> = None;
    let mut dump_thread: Option<thread::JoinHandle<()>> = None;
    match pipe2(OFlag::O_CLOEXEC) {
        Err(e) => log_crit!("Can't create info pipe: {e}"),
        Ok((pipe_r, pipe_w)) => match set_nonblocking(pipe_w.as_fd()) {
            Err(e) => log_crit!("Can't create info pipe: {e}"),
            Ok(()) => {
                let thread_shared = Arc::clone(&shared);
                let buffer_size = config.core_buffer_size;
                let spawned = thread::Builder::new()
                    .name("info-dump".to_string())
                    .spawn(move || {
                        let mut unwinder = unwinder::new_unwinder(buffer_size);
                        let pid = unwinder.prepare(pipe_r);
                        thread_shared
                            .pid
                            .store(if pid < 0 { PID_FAILED } else { pid }, SeqCst);

                        // Wait for the outputs; the lock is released the
                        // moment the pipeline is done opening them.
                        drop(lock_output_ready(&thread_shared));

                        if let Some(ctx) = thread_shared.dump_ctx.get() {
                            info::info_dump(ctx, &thread_shared.sink, unwinder.as_mut());
                        }
                    });
                match spawned {
                    Ok(handle) => {
                        dump_thread = Some(handle);
                        unw_pipe_w = Some(pipe_w);
                    }
                    Err(e) => {
                        log_crit!("Failed to create dumping thread: {e}");
                        return Err(e.into());
                    }
                }
            }
        },
    }

    // Priming: feed the first buffer to the unwinder until the PID shows
    // up, the buffer is delivered, or the retries run out.
    let mut buf = vec![0u8; PRIME_BUF_SIZE];
    let mut buf_read = 0usize;
    let mut buf_write = 0usize;
    if let Some(pipe_w) = &unw_pipe_w {
        match read_fill(stdin.as_fd(), &mut buf) {
            Err(e) => log_crit!("Can't read the core: {e}"),
            Ok(0) => log_crit!("Can't read the core: end of file"),
            Ok(n) => {
                buf_read = n;
                let mut tries = 0;
                while buf_write < buf_read && tries < PRIME_MAX_TRIES {
                    let rtn = write_some(pipe_w.as_fd(), &buf[buf_write..buf_read]);
                    if let Ok(n) = &rtn {
                        buf_write += *n;
                        tries = 0;
                    }
                    if shared.pid.load(SeqCst) != PID_UNKNOWN {
                        break;
                    }
                    if let Err(e) = &rtn {
                        if e.raw_os_error() != Some(libc::EAGAIN) {
                            break;
                        }
                        // A busy unwinder and one that wants more data than
                        // we have look the same from here; give it time.
                        thread::sleep(PRIME_RETRY_DELAY);
                        tries += 1;
                    }
                }
            }
        }
    }

    // PID-dependent setup: /proc can only be found once the PID is known.
    let mut pid_map = PidMap::default();
    let mut proc_dir: Option<ProcDir> = None;
    if !config.proc.ignore {
        if config.proc.path.is_none() {
            let pid = shared.pid.load(SeqCst);
            if pid > 0 {
                config.proc.path = Some(format!("/proc/{pid}/"));
            }
        }
        match config.proc.path.clone() {
            None => log_err!("Can't determine /proc path"),
            Some(path) => match ProcDir::open(Path::new(&path)) {
                Err(e) => log_err!("Can't open proc directory '{path}': {e}"),
                Ok(dir) => {
                    match read_proc_info(&dir, &mut config) {
                        Ok(map) => {
                            pid_map = map;
                            log_dbg!("Configuration after reading {path}:");
                            config.log_debug();
                        }
                        Err(_) => log_err!("Failed to read /proc info"),
                    }
                    proc_dir = Some(dir);
                }
            },
        }
    }

    // Output opening.
    let exe = config.proc.exe.clone().unwrap_or_default();
    let mut info_filename: Option<String> = None;
    let mut info_filters: Vec<FilterProc> = Vec::new();
    if config.info.output.is_some() {
        match output::open_output(&config.info, &start_utc, &exe) {
            Ok(out) => {
                shared.sink.attach(File::from(out.fd));
                info_filename = Some(out.filename);
                info_filters = out.filters;
            }
            Err(_) => log_crit!("Failed to open info output, ignoring"),
        }
    }

    let mut core_out: Option<OpenOutput> = None;
    if config.core.output.is_some() {
        match output::open_output(&config.core, &start_utc, &exe) {
            Ok(out) => core_out = Some(out),
            Err(_) => log_crit!("Failed to open core output, ignoring"),
        }
    }

    let ctx = DumpContext {
        start_utc,
        start_instant,
        exe: config.proc.exe.clone(),
        mappings: config.proc.maps.clone(),
        proc_dir,
        proc_ignore: config.proc.ignore,
        dump_root: config.proc_dump.root.clone(),
        dump_task: config.proc_dump.task.clone(),
        backtrace_max_depth: config.backtrace_max_depth,
        pid_map,
    };
    let _ = shared.dump_ctx.set(ctx);
    drop(guard);

    // Drain: the primed prefix goes to the core output first, then stdin
    // is copied to both sinks until end-of-file.
    let mut core_write_failed = false;
    write_core_chunk(core_out.as_ref(), &buf[..buf_read], &mut core_write_failed);
    if cfg!(feature = "libunwind") {
        if let Some(pipe_w) = &unw_pipe_w {
            let _ = set_blocking(pipe_w.as_fd());
            if buf_read > buf_write {
                let _ = write_some(pipe_w.as_fd(), &buf[buf_write..buf_read]);
            }
        }
    } else {
        // The degraded unwinder never reads past PID resolution; closing
        // the pipe now keeps the drain from filling it.
        unw_pipe_w = None;
    }

    loop {
        let n = match read_fill(stdin.as_fd(), &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        write_core_chunk(core_out.as_ref(), &buf[..n], &mut core_write_failed);
        if let Some(pipe_w) = &unw_pipe_w {
            let _ = write_some(pipe_w.as_fd(), &buf[..n]);
        }
    }

    // End-of-core: the unwinder sees EOF and finishes the info document.
    drop(unw_pipe_w);
    if let Some(handle) = dump_thread {
        if handle.join().is_err() {
            log_err!("Failed to join dumping thread");
        }
    }

    let core_filename = core_out.as_ref().map(|out| out.filename.clone());
    output::close_core_channel(&config.core, core_out);
    output::close_info_channel(
        &config.info,
        &shared.sink,
        info_filename.as_deref(),
        info_filters,
    );

    if let (Some(info_name), Some(core_name)) = (info_filename.as_deref(), core_filename.as_deref())
    {
        for command in &config.info_core_notify {
            output::spawn_notify(command, info_name, Some(core_name));
        }
    }

    Ok(())
}
