// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ffi::CString;

/// Whitespace characters separating command-line and configuration tokens.
pub const DELIM: &[char] = &[' ', '\n', '\r', '\t', '\x0c', '\x0b'];

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command '{0}' is empty")]
    Empty(String),
    #[error("Failed to convert token to CString: {0}")]
    TokenError(#[from] std::ffi::NulError),
}

// The argv_cstrings field is just storage.  Even though it's unreferenced,
// it keeps the pointers in argv_ptrs alive.
#[allow(dead_code)]
#[derive(Debug)]
pub struct PreparedCommand {
    command: String,
    argv_cstrings: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
}

impl PreparedCommand {
    /// Tokenizes `command` on whitespace and prepares a null-terminated argv
    /// ahead of time, so that no allocation happens between `fork` and `exec`.
    /// Tokens equal to `@1` or `@2` are replaced by the corresponding
    /// filename argument when one is supplied.
    pub fn new(
        command: &str,
        arg1: Option<&str>,
        arg2: Option<&str>,
    ) -> Result<Self, CommandError> {
        let tokens: Vec<&str> = command
            .split(DELIM)
            .filter(|t| !t.is_empty())
            .map(|t| match t {
                "@1" => arg1.unwrap_or(t),
                "@2" => arg2.unwrap_or(t),
                _ => t,
            })
            .collect();
        if tokens.is_empty() {
            return Err(CommandError::Empty(command.to_string()));
        }

        let argv_cstrings: Vec<CString> = tokens
            .iter()
            .map(|t| CString::new(*t))
            .collect::<Result<_, _>>()?;
        let argv_ptrs: Vec<*const libc::c_char> = argv_cstrings
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            command: command.to_string(),
            argv_cstrings,
            argv_ptrs,
        })
    }

    /// The command line this argv was built from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Replaces the current process image, resolving argv[0] through PATH.
    /// Only returns on failure.
    pub fn exec(&self) -> nix::errno::Errno {
        // Safety: the only way to make one of these is through `new`, which
        // ensures the argv array is well-formed and null-terminated.
        unsafe {
            libc::execvp(self.argv_cstrings[0].as_ptr(), self.argv_ptrs.as_ptr());
        }
        nix::errno::Errno::last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizes_on_whitespace() {
        let cmd = PreparedCommand::new("gzip  -9 \t-c", None, None).unwrap();
        let tokens: Vec<&str> = cmd
            .argv_cstrings
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(tokens, vec!["gzip", "-9", "-c"]);
    }

    #[test]
    fn test_argv_is_null_terminated() {
        let cmd = PreparedCommand::new("cat", None, None).unwrap();
        assert_eq!(cmd.argv_ptrs.len(), 2);
        assert!(cmd.argv_ptrs.last().unwrap().is_null());
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(matches!(
            PreparedCommand::new("  \t ", None, None),
            Err(CommandError::Empty(_))
        ));
    }

    #[test]
    fn test_substitutes_matching_tokens() {
        let cmd =
            PreparedCommand::new("notify-send @1 @2", Some("/tmp/info"), Some("/tmp/core"))
                .unwrap();
        let tokens: Vec<&str> = cmd
            .argv_cstrings
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(tokens, vec!["notify-send", "/tmp/info", "/tmp/core"]);
    }

    #[test]
    fn test_placeholder_kept_without_argument() {
        let cmd = PreparedCommand::new("logger @1", None, None).unwrap();
        let tokens: Vec<&str> = cmd
            .argv_cstrings
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(tokens, vec!["logger", "@1"]);
    }

    #[test]
    fn test_non_placeholder_tokens_untouched() {
        let cmd = PreparedCommand::new("mv @10 dest", Some("/tmp/x"), None).unwrap();
        let tokens: Vec<&str> = cmd
            .argv_cstrings
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(tokens, vec!["mv", "@10", "dest"]);
    }
}
