// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

mod command;
mod io;
mod process;

pub use command::{CommandError, PreparedCommand, DELIM};
pub use io::{read_fill, set_blocking, set_nonblocking, write_some};
pub use process::{open_devnull, spawn_process, terminate};
