// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-oriented `keyword = value` configuration parser.

use super::{Config, Mapping, EXISTS_NAMES};
use crate::log::LEVEL_NAMES;
use crate::{log_crit, log_info, log_warn};
use crashinfo_common::unix_utils::DELIM;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Longest accepted configuration line, matching the parser's line buffer.
const MAX_LINE: usize = 4095;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing value for '{0}'")]
    MissingValue(String),
    #[error("Unknown keyword '{0}'")]
    UnknownKeyword(String),
    #[error("Invalid value '{value}' for '{keyword}'")]
    InvalidValue { keyword: String, value: String },
    #[error("Garbage at the end of the line: {0}...")]
    TrailingGarbage(String),
    #[error("Line too long")]
    LineTooLong,
    #[error("Can't open configuration file '{path}': {source}")]
    FileOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Fatal error while parsing {path}:{line}")]
    File {
        path: String,
        line: usize,
        #[source]
        source: Box<ConfigError>,
    },
}

/// Ensures nothing but whitespace remains on the line.
fn parse_endline<'a>(mut rest: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    match rest.next() {
        None => Ok(()),
        Some(garbage) => {
            log_crit!("Garbage at the end of the line: {garbage}...");
            Err(ConfigError::TrailingGarbage(garbage.to_string()))
        }
    }
}

fn parse_enum<T: Copy>(
    keyword: &str,
    value: &str,
    table: &[(&str, T)],
    storage: &mut T,
) -> Result<(), ConfigError> {
    let mut tokens = value.split(DELIM).filter(|t| !t.is_empty());
    let token = tokens.next().unwrap_or("");
    if let Some((_, parsed)) = table.iter().find(|(name, _)| *name == token) {
        *storage = *parsed;
        return parse_endline(tokens);
    }

    let expected = table
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");
    log_crit!("Invalid value '{token}' for '{keyword}', expected one of [{expected}]");
    Err(ConfigError::InvalidValue {
        keyword: keyword.to_string(),
        value: token.to_string(),
    })
}

const BOOL_NAMES: &[(&str, bool)] = &[("0", false), ("1", true)];

/// Integer syntax of `strtol` with base 0: decimal, `0x` hex, leading-`0`
/// octal, optional sign.
fn parse_c_int(token: &str) -> Option<i64> {
    let (negative, rest) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let (radix, digits) = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };
    let value = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -value } else { value })
}

fn parse_int(keyword: &str, value: &str, storage: &mut i32) -> Result<(), ConfigError> {
    let mut tokens = value.split(DELIM).filter(|t| !t.is_empty());
    let token = tokens.next().unwrap_or("");
    match parse_c_int(token) {
        Some(parsed) => {
            *storage = parsed as i32;
            parse_endline(tokens)
        }
        None => {
            log_crit!("Keyword '{keyword}' requires integer value. Got '{token}'");
            Err(ConfigError::InvalidValue {
                keyword: keyword.to_string(),
                value: token.to_string(),
            })
        }
    }
}

fn parse_string(keyword: &str, value: &str, storage: &mut Option<String>) -> Result<(), ConfigError> {
    if value == "~" {
        *storage = None;
        return Ok(());
    }
    if storage.is_some() {
        log_info!("'{keyword}' specified multiple times");
    }
    *storage = Some(value.to_string());
    Ok(())
}

fn parse_string_multi(value: &str, storage: &mut Vec<String>) -> Result<(), ConfigError> {
    if value == "~" {
        storage.clear();
    } else {
        storage.push(value.to_string());
    }
    Ok(())
}

fn parse_mapping_multi(
    keyword: &str,
    value: &str,
    storage: &mut Vec<Mapping>,
) -> Result<(), ConfigError> {
    let parsed = value.split_once(':').and_then(|(addr, file)| {
        let addr = parse_c_int(addr.trim())?;
        Some(Mapping {
            addr: addr as u64,
            file: file.trim_end().to_string(),
        })
    });
    match parsed {
        Some(mapping) => {
            storage.push(mapping);
            Ok(())
        }
        None => {
            log_crit!(
                "Keyword '{keyword}' requires the argument in the form <addr>:<path>. Got '{value}'"
            );
            Err(ConfigError::InvalidValue {
                keyword: keyword.to_string(),
                value: value.to_string(),
            })
        }
    }
}

/// Parses one option line of the form `keyword = value`.  Blank lines and
/// `#` comments parse to nothing.
pub fn parse_line(config: &mut Config, line: &str) -> Result<(), ConfigError> {
    let (keyword_part, value) = match line.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (line, None),
    };

    let Some(keyword) = keyword_part.split(DELIM).find(|t| !t.is_empty()) else {
        return Ok(());
    };
    if keyword.starts_with('#') {
        return Ok(());
    }

    let value = value.map(|v| v.trim_start_matches(DELIM).trim_end_matches(DELIM));
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        log_crit!("Missing value for '{keyword}'");
        return Err(ConfigError::MissingValue(keyword.to_string()));
    };

    match keyword {
        // Info stream options
        "info_exists" => parse_enum(keyword, value, EXISTS_NAMES, &mut config.info.exists),
        "info_exists_seq" => parse_int(keyword, value, &mut config.info.exists_seq),
        "info_filter" => parse_string_multi(value, &mut config.info.filter),
        "info_mkdir" => parse_enum(keyword, value, BOOL_NAMES, &mut config.info.mkdir),
        "info_notify" => parse_string_multi(value, &mut config.info.notify),
        "info_output" => parse_string(keyword, value, &mut config.info.output),

        "backtrace_max_depth" => parse_int(keyword, value, &mut config.backtrace_max_depth),

        // Core stream options
        "core_exists" => parse_enum(keyword, value, EXISTS_NAMES, &mut config.core.exists),
        "core_exists_seq" => parse_int(keyword, value, &mut config.core.exists_seq),
        "core_filter" => parse_string_multi(value, &mut config.core.filter),
        "core_mkdir" => parse_enum(keyword, value, BOOL_NAMES, &mut config.core.mkdir),
        "core_notify" => parse_string_multi(value, &mut config.core.notify),
        "core_output" => parse_string(keyword, value, &mut config.core.output),
        "core_buffer_size" => parse_int(keyword, value, &mut config.core_buffer_size),

        "info_core_notify" => parse_string_multi(value, &mut config.info_core_notify),

        // Logging options
        "log_info" => parse_enum(keyword, value, LEVEL_NAMES, &mut config.log.info),
        "log_syslog" => parse_enum(keyword, value, LEVEL_NAMES, &mut config.log.syslog),
        "log_stderr" => parse_enum(keyword, value, LEVEL_NAMES, &mut config.log.stderr),

        // /proc options, used to provide information normally read from /proc
        "proc_ignore" => parse_enum(keyword, value, BOOL_NAMES, &mut config.proc.ignore),
        "proc_path" => parse_string(keyword, value, &mut config.proc.path),
        "proc_exe" => parse_string(keyword, value, &mut config.proc.exe),
        "proc_maps" => parse_mapping_multi(keyword, value, &mut config.proc.maps),

        // /proc dumping options
        "proc_dump_root" => parse_string_multi(value, &mut config.proc_dump.root),
        "proc_dump_task" => parse_string_multi(value, &mut config.proc_dump.task),

        _ => {
            log_warn!("Unknown keyword '{keyword}'");
            Err(ConfigError::UnknownKeyword(keyword.to_string()))
        }
    }
}

/// Parses a configuration file; the first failing line is fatal.
pub fn parse_file(config: &mut Config, path: &Path) -> Result<(), ConfigError> {
    let file = File::open(path).map_err(|source| {
        log_crit!("Can't open configuration file '{}': {}", path.display(), source);
        ConfigError::FileOpen {
            path: path.display().to_string(),
            source,
        }
    })?;

    let mut linenum = 0;
    for line in BufReader::new(file).lines() {
        linenum += 1;
        let result = match line {
            Ok(line) if line.len() > MAX_LINE => {
                log_crit!("Line too long: {}...", line.chars().take(40).collect::<String>());
                Err(ConfigError::LineTooLong)
            }
            Ok(line) => parse_line(config, &line),
            Err(source) => Err(ConfigError::FileOpen {
                path: path.display().to_string(),
                source,
            }),
        };
        if let Err(source) = result {
            log_crit!("Fatal error while parsing {}:{}", path.display(), linenum);
            return Err(ConfigError::File {
                path: path.display().to_string(),
                line: linenum,
                source: Box::new(source),
            });
        }
    }
    Ok(())
}
