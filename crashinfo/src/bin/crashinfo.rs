// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::error::ErrorKind;
use clap::{Arg, ArgAction, Command};
use crashinfo::{log_crit, parse_file, parse_line, Config};
use std::os::fd::AsFd;
use std::path::Path;
use std::process::ExitCode;

enum Step<'a> {
    File(&'a str),
    Line(&'a str),
}

fn main() -> ExitCode {
    // Before anything else: this process must never dump core itself.
    crashinfo::disable_core_generation();
    crashinfo::log::open_syslog();

    let cmd = Command::new("crashinfo")
        .about("Writes the core dump arriving on stdin and a structured crash report")
        .override_usage("crashinfo [-h] [-c config_file] [-o option=value]")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("config_file")
                .action(ArgAction::Append)
                .help("Load additional configuration from a file"),
        )
        .arg(
            Arg::new("option")
                .short('o')
                .value_name("option=value")
                .action(ArgAction::Append)
                .help("Apply one configuration line"),
        );

    let matches = match cmd.try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    // -c and -o take effect in command-line order.
    let mut steps: Vec<(usize, Step)> = Vec::new();
    if let (Some(values), Some(indices)) = (
        matches.get_many::<String>("config"),
        matches.indices_of("config"),
    ) {
        steps.extend(indices.zip(values.map(|v| Step::File(v.as_str()))));
    }
    if let (Some(values), Some(indices)) = (
        matches.get_many::<String>("option"),
        matches.indices_of("option"),
    ) {
        steps.extend(indices.zip(values.map(|v| Step::Line(v.as_str()))));
    }
    steps.sort_by_key(|(index, _)| *index);

    let mut config = Config::default();
    for (_, step) in steps {
        let result = match step {
            Step::File(path) => parse_file(&mut config, Path::new(path)),
            Step::Line(line) => parse_line(&mut config, line),
        };
        if result.is_err() {
            // The parser already reported the failure.
            return ExitCode::from(1);
        }
    }
    crashinfo::log::apply_log_config(&config.log);

    let stdin = match std::io::stdin().as_fd().try_clone_to_owned() {
        Ok(fd) => fd,
        Err(e) => {
            log_crit!("Can't access standard input: {e}");
            return ExitCode::from(1);
        }
    };

    match crashinfo::run_pipeline(config, stdin) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(1),
    }
}
