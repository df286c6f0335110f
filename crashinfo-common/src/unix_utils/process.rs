// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::command::PreparedCommand;
use nix::unistd::{fork, ForkResult, Pid};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Kills the program without raising an abort or calling at_exit.
pub fn terminate() -> ! {
    // Safety: no preconditions.
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Opens `/dev/null` read-write.  Some systems can fail to provide it
/// (e.g. chroot jails), so this failure is surfaced to the caller.
pub fn open_devnull() -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open("/dev/null")
}

/// Forks and executes a prepared command with its stdin and stdout wired to
/// the given descriptors.  The child leaves every other descriptor to
/// close-on-exec and `_exit`s if the exec fails; the parent returns the
/// child PID and still owns both descriptors.
pub fn spawn_process(
    command: &PreparedCommand,
    stdin: BorrowedFd<'_>,
    stdout: BorrowedFd<'_>,
) -> nix::Result<Pid> {
    // Safety: the child calls only async-signal-safe functions (dup2, execvp,
    // _exit); the argv was prepared before the fork.
    match unsafe { fork() }? {
        ForkResult::Child => {
            unsafe {
                let _ = libc::dup2(stdin.as_raw_fd(), 0);
                let _ = libc::dup2(stdout.as_raw_fd(), 1);
            }
            let _ = command.exec();
            terminate()
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unix_utils::{read_fill, write_some, PreparedCommand};
    use nix::fcntl::OFlag;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::pipe2;
    use std::os::fd::AsFd;

    #[test]
    fn test_spawn_process_cat_roundtrip() {
        let cmd = PreparedCommand::new("cat", None, None).unwrap();
        let (in_r, in_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (out_r, out_w) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let pid = spawn_process(&cmd, in_r.as_fd(), out_w.as_fd()).unwrap();
        drop(in_r);
        drop(out_w);

        write_some(in_w.as_fd(), b"roundtrip").unwrap();
        drop(in_w);

        let mut buf = [0u8; 32];
        let n = read_fill(out_r.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"roundtrip");

        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[test]
    fn test_spawn_process_exec_failure_exits_nonzero() {
        let cmd = PreparedCommand::new("/nonexistent/binary-for-test", None, None).unwrap();
        let (in_r, _in_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (_out_r, out_w) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let pid = spawn_process(&cmd, in_r.as_fd(), out_w.as_fd()).unwrap();
        match waitpid(pid, None).unwrap() {
            WaitStatus::Exited(p, code) => {
                assert_eq!(p, pid);
                assert_ne!(code, 0);
            }
            other => panic!("unexpected wait status: {other:?}"),
        }
    }

    #[test]
    fn test_open_devnull() {
        use std::io::Write;
        let mut f = open_devnull().unwrap();
        f.write_all(b"discarded").unwrap();
    }
}
