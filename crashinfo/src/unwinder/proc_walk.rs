// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Degraded unwinder: no core parsing, no registers, no backtraces.  The
//! thread list comes from `/proc/<PID>/task`, which requires the PID to
//! have been supplied through configuration.

use super::Unwinder;
use crate::info::{DumpContext, InfoSink};
use crate::log_err;
use std::fs;
use std::io::Write;
use std::os::fd::OwnedFd;

#[derive(Default)]
pub struct ProcWalkUnwinder {
    // Kept open so the pipeline's priming writes land in the pipe buffer
    // instead of failing; dropped when the unwinder goes away.
    _core_fd: Option<OwnedFd>,
}

impl ProcWalkUnwinder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Unwinder for ProcWalkUnwinder {
    fn prepare(&mut self, core_fd: OwnedFd) -> i32 {
        self._core_fd = Some(core_fd);
        -1
    }

    fn dump(
        &mut self,
        ctx: &DumpContext,
        sink: &InfoSink,
        task_dumper: &mut dyn FnMut(i32),
    ) -> anyhow::Result<()> {
        if ctx.proc_ignore {
            sink.emit(|w| writeln!(w, "threads: ~ # Unwinder is disabled and proc_ignore = 1"));
            return Ok(());
        }

        let Some(dir) = ctx.proc_dir.as_ref() else {
            log_err!("Can't enumerate threads: no /proc directory");
            anyhow::bail!("no /proc directory");
        };
        let task_dir = dir.path().join("task");
        let entries = fs::read_dir(&task_dir).map_err(|e| {
            log_err!("Can't open '{}': {}", task_dir.display(), e);
            anyhow::Error::from(e)
        })?;

        let mut tids: Vec<i32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        tids.sort_unstable();

        sink.emit(|w| writeln!(w, "threads:"));
        for tid in tids {
            task_dumper(tid);
        }
        Ok(())
    }
}
