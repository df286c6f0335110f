// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash handler invoked by the kernel's core-dispatch facility.  Reads
//! the victim's core dump from standard input, copies it to a configured
//! destination (optionally through a filter process chain), and writes a
//! structured sidecar document describing the crash: executable, command
//! line, mappings, per-thread registers and backtraces, and snapshots of
//! selected `/proc` files.

pub mod config;
pub mod info;
pub mod log;
pub mod output;
pub mod pipeline;
pub mod proc;
pub mod unwinder;

pub use config::{parse_file, parse_line, Config, ConfigError};
pub use pipeline::{disable_core_generation, run_pipeline};
