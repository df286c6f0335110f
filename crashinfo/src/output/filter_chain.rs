// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds the chain of filter processes between an output's write side and
//! its destination file.  Children are connected stdin-to-stdout by pipes
//! in command order; every pipe end handed to a child is dropped in the
//! parent right after the spawn, so no descriptor outlives a failure.

use crate::{log_crit, log_dbg, log_err};
use crashinfo_common::unix_utils::{spawn_process, CommandError, PreparedCommand};
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{pipe2, Pid};
use std::os::fd::{AsFd, OwnedFd};

/// One running filter: the obligation to reap `pid` at channel close.
#[derive(Debug)]
pub struct FilterProc {
    pub command: String,
    pub pid: Pid,
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Can't create filter pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("Forking process '{command}' failed: {source}")]
    Spawn {
        command: String,
        #[source]
        source: nix::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Forcibly terminates and reaps every already-spawned chain member.
fn kill_chain(spawned: &mut Vec<FilterProc>) {
    for filter in spawned.drain(..) {
        log_dbg!("Killing {}: '{}'", filter.pid, filter.command);
        let _ = kill(filter.pid, Signal::SIGKILL);
        let _ = waitpid(filter.pid, None);
    }
}

fn spawn_filter(
    command: &str,
    stdin: &OwnedFd,
    stdout: &OwnedFd,
    spawned: &mut Vec<FilterProc>,
) -> Result<(), FilterError> {
    let prepared = match PreparedCommand::new(command, None, None) {
        Ok(p) => p,
        Err(e) => {
            log_crit!("Can't prepare filter '{command}': {e}");
            kill_chain(spawned);
            return Err(e.into());
        }
    };
    match spawn_process(&prepared, stdin.as_fd(), stdout.as_fd()) {
        Ok(pid) => {
            spawned.push(FilterProc {
                command: command.to_string(),
                pid,
            });
            Ok(())
        }
        Err(e) => {
            log_crit!("Forking process '{command}' failed: {e}");
            kill_chain(spawned);
            Err(FilterError::Spawn {
                command: command.to_string(),
                source: e,
            })
        }
    }
}

/// Spawns `filters` in order so that bytes written to `head`'s pipe emerge
/// at `tail`.  The first child reads from `head`, the last writes to
/// `tail`; intermediate members are joined by fresh pipes.  On failure no
/// spawned child is left running.
pub fn build_filter_chain(
    filters: &[String],
    head: OwnedFd,
    tail: OwnedFd,
) -> Result<Vec<FilterProc>, FilterError> {
    let Some((last, rest)) = filters.split_last() else {
        return Ok(Vec::new());
    };

    let mut spawned = Vec::with_capacity(filters.len());
    let mut next_in = head;
    for command in rest {
        let (read_end, write_end) = match pipe2(OFlag::O_CLOEXEC) {
            Ok(ends) => ends,
            Err(e) => {
                log_err!("Can't create filter pipe: {e}");
                kill_chain(&mut spawned);
                return Err(FilterError::Pipe(e));
            }
        };
        spawn_filter(command, &next_in, &write_end, &mut spawned)?;
        // The child holds duplicates of both ends now; ours close here.
        next_in = read_end;
    }
    spawn_filter(last, &next_in, &tail, &mut spawned)?;
    Ok(spawned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashinfo_common::unix_utils::write_some;
    use nix::sys::wait::WaitStatus;
    use std::io::Read;
    use std::os::fd::AsFd;

    fn reap_all(filters: Vec<FilterProc>) {
        for f in filters {
            match waitpid(f.pid, None).unwrap() {
                WaitStatus::Exited(_, 0) => {}
                other => panic!("filter '{}' did not exit cleanly: {other:?}", f.command),
            }
        }
    }

    #[test]
    fn test_empty_chain_spawns_nothing() {
        let (head, _head_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tail: OwnedFd = std::fs::File::create(dir.path().join("out")).unwrap().into();
        let chain = build_filter_chain(&[], head, tail).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_single_identity_filter() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out");
        let tail: OwnedFd = std::fs::File::create(&out_path).unwrap().into();
        let (head_r, head_w) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let chain = build_filter_chain(&["cat".to_string()], head_r, tail).unwrap();
        assert_eq!(chain.len(), 1);

        write_some(head_w.as_fd(), b"ABCDEFGH").unwrap();
        drop(head_w);
        reap_all(chain);

        assert_eq!(std::fs::read(&out_path).unwrap(), b"ABCDEFGH");
    }

    #[test]
    fn test_two_stage_chain_transforms_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out");
        let tail: OwnedFd = std::fs::File::create(&out_path).unwrap().into();
        let (head_r, head_w) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let chain = build_filter_chain(
            &["tr A X".to_string(), "tr B Y".to_string()],
            head_r,
            tail,
        )
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].command, "tr A X");

        write_some(head_w.as_fd(), b"ABBA").unwrap();
        drop(head_w);
        reap_all(chain);

        assert_eq!(std::fs::read(&out_path).unwrap(), b"XYYX");
    }

    #[test]
    fn test_failed_chain_leaves_no_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let tail: OwnedFd = std::fs::File::create(dir.path().join("out")).unwrap().into();
        let (head_r, head_w) = pipe2(OFlag::O_CLOEXEC).unwrap();

        // An empty command cannot be prepared; the first (valid) member must
        // be killed and reaped before the error returns.
        let err = build_filter_chain(
            &["cat".to_string(), "   ".to_string()],
            head_r,
            tail,
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::Command(_)));

        // All pipe ends on our side are closed; a reader would see EOF.
        drop(head_w);
    }

    #[test]
    fn test_chain_survives_large_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out");
        let tail: OwnedFd = std::fs::File::create(&out_path).unwrap().into();
        let (head_r, head_w) = pipe2(OFlag::O_CLOEXEC).unwrap();

        let chain = build_filter_chain(&["cat".to_string()], head_r, tail).unwrap();

        // More than one pipe buffer, fed from a thread while we wait.
        let payload = vec![0x5au8; 256 * 1024];
        let feeder = {
            let payload = payload.clone();
            std::thread::spawn(move || {
                let mut off = 0;
                while off < payload.len() {
                    off += write_some(head_w.as_fd(), &payload[off..]).unwrap();
                }
            })
        };
        feeder.join().unwrap();
        reap_all(chain);

        let mut written = Vec::new();
        std::fs::File::open(&out_path)
            .unwrap()
            .read_to_end(&mut written)
            .unwrap();
        assert_eq!(written, payload);
    }
}
