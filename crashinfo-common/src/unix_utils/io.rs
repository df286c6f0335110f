// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Reads until `buf` is full or end-of-file, retrying on EINTR.
/// Returns the number of bytes read (0 at immediate EOF).  An error after
/// some data was already read is swallowed and the partial count returned.
pub fn read_fill(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let mut size = 0usize;
    while size < buf.len() {
        // Safety: the buffer range is valid for the requested length.
        let rtn = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf[size..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - size,
            )
        };
        match rtn {
            0 => break,
            n if n > 0 => size += n as usize,
            _ => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                if size == 0 {
                    return Err(err);
                }
                break;
            }
        }
    }
    Ok(size)
}

/// Writes as much of `buf` as the descriptor accepts, retrying on EINTR.
/// Returns the number of bytes written; a short count means the descriptor
/// stopped accepting data (e.g. EAGAIN on a non-blocking pipe).  An error
/// before any byte was written is returned as such.
pub fn write_some(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let mut size = 0usize;
    while size < buf.len() {
        // Safety: the buffer range is valid for the requested length.
        let rtn = unsafe {
            libc::write(
                fd.as_raw_fd(),
                buf[size..].as_ptr() as *const libc::c_void,
                buf.len() - size,
            )
        };
        if rtn >= 0 {
            size += rtn as usize;
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if size == 0 {
                return Err(err);
            }
            break;
        }
    }
    Ok(size)
}

fn set_fl(fd: BorrowedFd<'_>, set: bool, flag: libc::c_int) -> io::Result<()> {
    // Safety: F_GETFL/F_SETFL on a borrowed, open descriptor.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        let flags = if set { flags | flag } else { flags & !flag };
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    set_fl(fd, true, libc::O_NONBLOCK)
}

pub fn set_blocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    set_fl(fd, false, libc::O_NONBLOCK)
}
