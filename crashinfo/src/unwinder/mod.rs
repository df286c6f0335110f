// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unwinder capability: resolves the victim PID from the piped core
//! and emits the per-thread records of the info document.  The concrete
//! variant is chosen at build time: with the `libunwind` feature the core
//! is parsed through libunwind-coredump; without it the handler degrades
//! to walking `/proc/<PID>/task`.

#[cfg(feature = "libunwind")]
mod coredump;
mod proc_walk;

#[cfg(feature = "libunwind")]
pub use coredump::CoredumpUnwinder;
pub use proc_walk::ProcWalkUnwinder;

use crate::info::{DumpContext, InfoSink};
use std::os::fd::OwnedFd;

pub trait Unwinder: Send {
    /// Takes ownership of the read end of the core pipe and resolves the
    /// victim PID: the lowest PID present in the core that also exists
    /// under `/proc`, else the lowest PID overall.  Returns -1 when the
    /// PID cannot be recovered.  Called once, on the unwinder thread,
    /// before any output exists.
    fn prepare(&mut self, core_fd: OwnedFd) -> i32;

    /// Writes the `threads:` section.  `task_dumper` is invoked with each
    /// thread's ID before that thread's own records, so the caller can
    /// interleave the per-task snapshot.
    fn dump(
        &mut self,
        ctx: &DumpContext,
        sink: &InfoSink,
        task_dumper: &mut dyn FnMut(i32),
    ) -> anyhow::Result<()>;
}

#[cfg(feature = "libunwind")]
pub fn new_unwinder(core_buffer_size: i32) -> Box<dyn Unwinder> {
    Box::new(CoredumpUnwinder::new(core_buffer_size))
}

#[cfg(not(feature = "libunwind"))]
pub fn new_unwinder(_core_buffer_size: i32) -> Box<dyn Unwinder> {
    Box::new(ProcWalkUnwinder::new())
}
