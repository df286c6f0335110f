// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! libunwind-coredump backed unwinder.
//!
//! The core arrives on a pipe and cannot be rewound, so this uses the
//! coredump extension that reads from a file descriptor with a bounded
//! backward-seek buffer (`_UCD_create_fd`).  Bindings are written by hand
//! against the arch-prefixed libunwind entry points; only x86_64 and
//! aarch64 are wired up.

use super::Unwinder;
use crate::info::{spaces, write_quoted, DumpContext, InfoSink};
use crate::{log_dbg, log_err, log_warn};
use std::ffi::{c_char, c_int, CStr, CString};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

#[allow(non_camel_case_types, non_upper_case_globals)]
mod ffi {
    use std::ffi::{c_char, c_int, c_void};

    pub type unw_word_t = u64;
    pub type unw_addr_space_t = *mut c_void;

    /// Opaque accessor table exported by libunwind-coredump.
    #[repr(C)]
    pub struct unw_accessors_t {
        _opaque: [u8; 0],
    }

    /// Opaque coredump handle.
    #[repr(C)]
    pub struct UCD_info {
        _opaque: [u8; 0],
    }

    // From libunwind-x86_64.h: UNW_TDEP_CURSOR_LEN is 127.
    #[cfg(target_arch = "x86_64")]
    pub const UNW_TDEP_CURSOR_LEN: usize = 127;
    // From libunwind-aarch64.h: UNW_TDEP_CURSOR_LEN is 250.
    #[cfg(target_arch = "aarch64")]
    pub const UNW_TDEP_CURSOR_LEN: usize = 250;

    #[repr(C)]
    pub struct unw_cursor_t {
        pub opaque: [unw_word_t; UNW_TDEP_CURSOR_LEN],
    }

    impl unw_cursor_t {
        pub fn zeroed() -> Self {
            Self {
                opaque: [0; UNW_TDEP_CURSOR_LEN],
            }
        }
    }

    #[repr(C)]
    pub struct unw_proc_info_t {
        pub start_ip: unw_word_t,
        pub end_ip: unw_word_t,
        pub lsda: unw_word_t,
        pub handler: unw_word_t,
        pub gp: unw_word_t,
        pub flags: unw_word_t,
        pub format: c_int,
        pub unwind_info_size: c_int,
        pub unwind_info: *mut c_void,
    }

    impl unw_proc_info_t {
        pub fn zeroed() -> Self {
            // Safety: plain data, all-zero is a valid value.
            unsafe { std::mem::zeroed() }
        }
    }

    // UNW_TDEP_IP for each supported architecture.
    #[cfg(target_arch = "x86_64")]
    pub const UNW_REG_IP: c_int = 16; // UNW_X86_64_RIP
    #[cfg(target_arch = "aarch64")]
    pub const UNW_REG_IP: c_int = 32; // UNW_AARCH64_PC

    extern "C" {
        pub static mut _UCD_accessors: unw_accessors_t;

        pub fn _UCD_create_fd(
            fd: c_int,
            filename: *const c_char,
            backing_buf_size: c_int,
        ) -> *mut UCD_info;
        pub fn _UCD_destroy(ui: *mut UCD_info);
        pub fn _UCD_get_num_threads(ui: *mut UCD_info) -> c_int;
        pub fn _UCD_select_thread(ui: *mut UCD_info, thread: c_int);
        pub fn _UCD_get_pid(ui: *mut UCD_info) -> libc::pid_t;
        pub fn _UCD_get_utime(ui: *mut UCD_info) -> *const libc::timeval;
        pub fn _UCD_get_stime(ui: *mut UCD_info) -> *const libc::timeval;
        pub fn _UCD_add_backing_file_at_vaddr(
            ui: *mut UCD_info,
            vaddr: unw_word_t,
            filename: *const c_char,
        ) -> c_int;
        pub fn _UCD_get_proc_backing_file(ui: *mut UCD_info, ip: unw_word_t) -> *const c_char;
    }

    // The generic remote-unwind API is arch-prefixed by the libunwind
    // headers; declare the mangled names and alias them below.
    #[cfg(target_arch = "x86_64")]
    extern "C" {
        pub fn _Ux86_64_create_addr_space(
            accessors: *mut unw_accessors_t,
            byteorder: c_int,
        ) -> unw_addr_space_t;
        pub fn _Ux86_64_destroy_addr_space(addr_space: unw_addr_space_t);
        pub fn _Ux86_64_init_remote(
            cursor: *mut unw_cursor_t,
            addr_space: unw_addr_space_t,
            arg: *mut c_void,
        ) -> c_int;
        pub fn _Ux86_64_step(cursor: *mut unw_cursor_t) -> c_int;
        pub fn _Ux86_64_get_reg(
            cursor: *mut unw_cursor_t,
            reg: c_int,
            value: *mut unw_word_t,
        ) -> c_int;
        pub fn _Ux86_64_get_proc_info(
            cursor: *mut unw_cursor_t,
            info: *mut unw_proc_info_t,
        ) -> c_int;
        pub fn _Ux86_64_get_proc_name(
            cursor: *mut unw_cursor_t,
            name: *mut c_char,
            len: usize,
            offset: *mut unw_word_t,
        ) -> c_int;
        pub fn _Ux86_64_is_signal_frame(cursor: *mut unw_cursor_t) -> c_int;
        pub fn _Ux86_64_strerror(code: c_int) -> *const c_char;
    }

    #[cfg(target_arch = "x86_64")]
    pub use self::{
        _Ux86_64_create_addr_space as unw_create_addr_space,
        _Ux86_64_destroy_addr_space as unw_destroy_addr_space,
        _Ux86_64_get_proc_info as unw_get_proc_info,
        _Ux86_64_get_proc_name as unw_get_proc_name, _Ux86_64_get_reg as unw_get_reg,
        _Ux86_64_init_remote as unw_init_remote,
        _Ux86_64_is_signal_frame as unw_is_signal_frame, _Ux86_64_step as unw_step,
        _Ux86_64_strerror as unw_strerror,
    };

    #[cfg(target_arch = "aarch64")]
    extern "C" {
        pub fn _Uaarch64_create_addr_space(
            accessors: *mut unw_accessors_t,
            byteorder: c_int,
        ) -> unw_addr_space_t;
        pub fn _Uaarch64_destroy_addr_space(addr_space: unw_addr_space_t);
        pub fn _Uaarch64_init_remote(
            cursor: *mut unw_cursor_t,
            addr_space: unw_addr_space_t,
            arg: *mut c_void,
        ) -> c_int;
        pub fn _Uaarch64_step(cursor: *mut unw_cursor_t) -> c_int;
        pub fn _Uaarch64_get_reg(
            cursor: *mut unw_cursor_t,
            reg: c_int,
            value: *mut unw_word_t,
        ) -> c_int;
        pub fn _Uaarch64_get_proc_info(
            cursor: *mut unw_cursor_t,
            info: *mut unw_proc_info_t,
        ) -> c_int;
        pub fn _Uaarch64_get_proc_name(
            cursor: *mut unw_cursor_t,
            name: *mut c_char,
            len: usize,
            offset: *mut unw_word_t,
        ) -> c_int;
        pub fn _Uaarch64_is_signal_frame(cursor: *mut unw_cursor_t) -> c_int;
        pub fn _Uaarch64_strerror(code: c_int) -> *const c_char;
    }

    #[cfg(target_arch = "aarch64")]
    pub use self::{
        _Uaarch64_create_addr_space as unw_create_addr_space,
        _Uaarch64_destroy_addr_space as unw_destroy_addr_space,
        _Uaarch64_get_proc_info as unw_get_proc_info,
        _Uaarch64_get_proc_name as unw_get_proc_name, _Uaarch64_get_reg as unw_get_reg,
        _Uaarch64_init_remote as unw_init_remote,
        _Uaarch64_is_signal_frame as unw_is_signal_frame, _Uaarch64_step as unw_step,
        _Uaarch64_strerror as unw_strerror,
    };
}

fn strerror(code: c_int) -> String {
    // Safety: unw_strerror returns a static NUL-terminated string.
    unsafe { CStr::from_ptr(ffi::unw_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

pub struct CoredumpUnwinder {
    buffer_size: i32,
    addr_space: ffi::unw_addr_space_t,
    ui: *mut ffi::UCD_info,
    ok: bool,
    _core_fd: Option<OwnedFd>,
}

// The raw handles are only ever used from the unwinder thread; they are
// moved there whole, never shared.
unsafe impl Send for CoredumpUnwinder {}

/// Register dump of the selected thread: every register the unwinder can
/// produce, four words per line.
fn emit_registers(w: &mut dyn Write, cursor: &mut ffi::unw_cursor_t) -> std::io::Result<()> {
    write!(w, "    registers: [")?;
    for i in 0..256 {
        let mut reg: ffi::unw_word_t = 0;
        // Safety: the cursor was initialized by unw_init_remote.
        if unsafe { ffi::unw_get_reg(cursor, i, &mut reg) } != 0 {
            break;
        }
        if i != 0 {
            write!(w, ",")?;
        }
        if i % 4 == 0 {
            write!(w, "\n     ")?;
        }
        write!(w, " 0x{reg:016x}")?;
    }
    writeln!(w, " ]")
}

impl CoredumpUnwinder {
    pub fn new(buffer_size: i32) -> Self {
        Self {
            buffer_size,
            addr_space: std::ptr::null_mut(),
            ui: std::ptr::null_mut(),
            ok: false,
            _core_fd: None,
        }
    }

    fn emit_backtrace(
        &mut self,
        w: &mut dyn Write,
        cursor: &mut ffi::unw_cursor_t,
        max_depth: i32,
    ) -> std::io::Result<()> {
        write!(w, "    backtrace: [")?;
        for depth in 0..max_depth.max(0) {
            let mut ip: ffi::unw_word_t = 0;
            // Safety: cursor initialized; all calls below only read it.
            let have_ip = unsafe { ffi::unw_get_reg(cursor, ffi::UNW_REG_IP, &mut ip) } == 0;

            let mut info = ffi::unw_proc_info_t::zeroed();
            let (length, exception) =
                if unsafe { ffi::unw_get_proc_info(cursor, &mut info) } == 0 {
                    (info.end_ip - info.start_ip, (info.handler != 0) as i32)
                } else {
                    (0, -1)
                };

            let signal = match unsafe { ffi::unw_is_signal_frame(cursor) } {
                n if n > 0 => 1,
                0 => 0,
                _ => -1,
            };

            if depth > 0 {
                write!(w, ",")?;
            }
            if have_ip {
                write!(w, "\n      {{ a: {ip:016x}")?;
            } else {
                write!(w, "\n      {{ a: UNKNOWN")?;
            }

            let mut name = [0 as c_char; 256];
            let mut offset: ffi::unw_word_t = 0;
            if unsafe {
                ffi::unw_get_proc_name(cursor, name.as_mut_ptr(), name.len(), &mut offset)
            } == 0
            {
                let name = unsafe { CStr::from_ptr(name.as_ptr()) }.to_string_lossy();
                write!(
                    w,
                    ", s: {name},{} o: {offset:#5x}, l: {length:#5x}",
                    spaces(20usize.saturating_sub(name.len()))
                )?;
            }

            write!(w, ", e: {exception}, S: {signal}")?;

            // Safety: ui is valid while self lives.
            let file = unsafe { ffi::_UCD_get_proc_backing_file(self.ui, ip) };
            if !file.is_null() {
                write!(w, ", f: ")?;
                write_quoted(w, unsafe { CStr::from_ptr(file) }.to_bytes())?;
            }
            write!(w, " }}")?;

            if unsafe { ffi::unw_step(cursor) } <= 0 {
                break;
            }
        }
        writeln!(w, " ]")
    }
}

impl Drop for CoredumpUnwinder {
    fn drop(&mut self) {
        // Safety: both handles were created by prepare and are not used
        // after this point.
        unsafe {
            if !self.ui.is_null() {
                ffi::_UCD_destroy(self.ui);
            }
            if !self.addr_space.is_null() {
                ffi::unw_destroy_addr_space(self.addr_space);
            }
        }
    }
}

impl Unwinder for CoredumpUnwinder {
    fn prepare(&mut self, core_fd: OwnedFd) -> i32 {
        // Safety: the accessor table and the fd stay alive as long as the
        // created handles (the fd is stored on self below).
        unsafe {
            self.addr_space =
                ffi::unw_create_addr_space(std::ptr::addr_of_mut!(ffi::_UCD_accessors), 0);
            if self.addr_space.is_null() {
                log_err!("Failed to create address space");
                return -1;
            }

            self.ui = ffi::_UCD_create_fd(
                core_fd.as_raw_fd(),
                c"<pipe>".as_ptr(),
                self.buffer_size,
            );
            if self.ui.is_null() {
                log_err!("Failed to create UCD_info");
                ffi::unw_destroy_addr_space(self.addr_space);
                self.addr_space = std::ptr::null_mut();
                return -1;
            }
            self._core_fd = Some(core_fd);

            let mut minpid = i32::MAX;
            let mut minpid_fs = i32::MAX;
            for thread in 0..ffi::_UCD_get_num_threads(self.ui) {
                ffi::_UCD_select_thread(self.ui, thread);
                let pid = ffi::_UCD_get_pid(self.ui);
                if pid < minpid {
                    minpid = pid;
                }
                if pid < minpid_fs && Path::new(&format!("/proc/{pid}")).exists() {
                    minpid_fs = pid;
                }
            }

            let pid = if minpid_fs < i32::MAX { minpid_fs } else { minpid };
            if pid == i32::MAX {
                log_err!("Core contains no threads");
                return -1;
            }
            log_dbg!("Unwinder returned PID: {pid}");
            self.ok = true;
            pid
        }
    }

    fn dump(
        &mut self,
        ctx: &DumpContext,
        sink: &InfoSink,
        task_dumper: &mut dyn FnMut(i32),
    ) -> anyhow::Result<()> {
        anyhow::ensure!(self.ok, "unwinder initialization failed");

        if ctx.mappings.is_empty() {
            log_warn!("Mapping information is not available");
        } else {
            for map in &ctx.mappings {
                if let Ok(file) = CString::new(map.file.as_str()) {
                    // Safety: ui is valid, the string outlives the call.
                    unsafe {
                        ffi::_UCD_add_backing_file_at_vaddr(self.ui, map.addr, file.as_ptr());
                    }
                }
            }
        }

        let mut cursor = ffi::unw_cursor_t::zeroed();
        // Safety: handles created in prepare; self.ok guards them.
        let rtn = unsafe { ffi::unw_init_remote(&mut cursor, self.addr_space, self.ui.cast()) };
        if rtn != 0 {
            log_err!("Failed to initialize the unwind cursor: {}", strerror(rtn));
            anyhow::bail!("unwind cursor initialization failed");
        }

        sink.emit(|w| writeln!(w, "threads:"));
        let num_threads = unsafe { ffi::_UCD_get_num_threads(self.ui) };
        for thread in 0..num_threads {
            // Safety: ui valid; selecting a thread only mutates the handle.
            unsafe { ffi::_UCD_select_thread(self.ui, thread) };

            let rtn =
                unsafe { ffi::unw_init_remote(&mut cursor, self.addr_space, self.ui.cast()) };
            if rtn != 0 {
                log_err!("Failed to initialize the unwind cursor: {}", strerror(rtn));
                continue;
            }

            task_dumper(unsafe { ffi::_UCD_get_pid(self.ui) });

            let utime = read_timeval(unsafe { ffi::_UCD_get_utime(self.ui) });
            let stime = read_timeval(unsafe { ffi::_UCD_get_stime(self.ui) });
            let max_depth = ctx.backtrace_max_depth;
            sink.emit(|w| {
                writeln!(w, "    user_time: {}.{:06}", utime.0, utime.1)?;
                writeln!(w, "    system_time: {}.{:06}", stime.0, stime.1)?;
                emit_registers(w, &mut cursor)?;
                self.emit_backtrace(w, &mut cursor, max_depth)
            });
        }
        Ok(())
    }
}

fn read_timeval(tv: *const libc::timeval) -> (i64, i64) {
    if tv.is_null() {
        return (0, 0);
    }
    // Safety: non-null pointers from the coredump handle point at its own
    // storage, which outlives this call.
    unsafe { ((*tv).tv_sec as i64, (*tv).tv_usec as i64) }
}
