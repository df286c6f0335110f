// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reading the victim's `/proc/<PID>` directory: the executable link, the
//! executable memory mappings, and the namespace-to-host thread ID table.

use crate::config::{Config, Mapping};
use crate::{log_crit, log_err, log_notice, log_warn};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("Can't get executable path: {0}")]
    ExeLink(#[source] io::Error),
    #[error("Can't open mappings: {0}")]
    Maps(#[source] io::Error),
    #[error("Can't open task directory: {0}")]
    TaskDir(#[source] io::Error),
    #[error("Malformed NSpid line '{0}'")]
    MalformedNspid(String),
}

/// Handle on the victim's `/proc/<PID>` directory.  The directory is held
/// open for the lifetime of the run; members are opened by joined path,
/// which is equivalent while the victim is frozen being dumped.
#[derive(Debug)]
pub struct ProcDir {
    path: PathBuf,
    _handle: File,
}

impl ProcDir {
    pub fn open(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(io::Error::from(io::ErrorKind::NotADirectory));
        }
        let handle = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            _handle: handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open_file(&self, relative: &str) -> io::Result<File> {
        File::open(self.path.join(relative))
    }

    pub fn read_link(&self, relative: &str) -> io::Result<PathBuf> {
        fs::read_link(self.path.join(relative))
    }

    pub fn subdir(&self, relative: &str) -> io::Result<ProcDir> {
        ProcDir::open(&self.path.join(relative))
    }
}

/// Namespace-local to host-visible thread ID table, built from the last
/// `NSpid:` field of each task's status file.
#[derive(Debug, Default)]
pub struct PidMap {
    entries: Vec<(i32, i32)>,
}

impl PidMap {
    /// Maps a namespace-local thread ID to the host one.  An ID that is
    /// already host-visible passes through; anything unknown is returned
    /// unchanged with a warning.
    pub fn map(&self, nspid: i32) -> i32 {
        if let Some((_, pid)) = self.entries.iter().find(|(ns, _)| *ns == nspid) {
            return *pid;
        }
        if self.entries.iter().any(|(_, pid)| *pid == nspid) {
            return nspid;
        }
        log_warn!("Failed to map NS pid {nspid}");
        nspid
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One maps line: keep executable mappings backed by an absolute path.
fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    if perms.as_bytes().get(2) != Some(&b'x') {
        return None;
    }
    let addr = u64::from_str_radix(range.split('-').next()?, 16).ok()?;
    // The pathname is the only field that can contain '/', and may itself
    // contain spaces; take everything from the first '/'.
    let path_start = line.find('/')?;
    Some(Mapping {
        addr,
        file: line[path_start..].trim_end().to_string(),
    })
}

/// Extracts the namespace-local ID: the last field of the `NSpid:` line.
fn parse_nspid_line(line: &str) -> Option<i32> {
    line.split_whitespace().last()?.parse().ok()
}

fn scan_task_status(dir: &ProcDir, name: &str) -> Result<Option<i32>, ProcError> {
    let relative = format!("task/{name}/status");
    let file = match dir.open_file(&relative) {
        Ok(f) => f,
        Err(e) => {
            log_err!("Can't open '{relative}': {e}");
            return Ok(None);
        }
    };
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if !line.starts_with("NSpid:") {
            continue;
        }
        return match parse_nspid_line(&line) {
            Some(nspid) => Ok(Some(nspid)),
            None => {
                log_notice!("Malformed line '{line}'");
                Err(ProcError::MalformedNspid(line))
            }
        };
    }
    Ok(None)
}

/// Reads `/proc/<PID>` into the configuration: the executable link and the
/// executable mappings (both only when not already supplied), and the
/// NSpid table.  Tasks whose status cannot be read are skipped; a
/// malformed `NSpid:` line aborts the scan.
pub fn read_proc_info(dir: &ProcDir, config: &mut Config) -> Result<PidMap, ProcError> {
    if config.proc.exe.is_none() {
        match dir.read_link("exe") {
            Ok(target) => config.proc.exe = Some(target.to_string_lossy().into_owned()),
            Err(e) => {
                log_crit!("Can't get executable path: {e}");
                return Err(ProcError::ExeLink(e));
            }
        }
    }

    if config.proc.maps.is_empty() {
        let file = dir.open_file("maps").map_err(|e| {
            log_crit!("Can't open mappings: {e}");
            ProcError::Maps(e)
        })?;
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if let Some(mapping) = parse_maps_line(&line) {
                config.proc.maps.push(mapping);
            }
        }
    }

    let task_dir = dir.path().join("task");
    let entries = fs::read_dir(&task_dir).map_err(|e| {
        log_err!("Can't open '{}': {}", task_dir.display(), e);
        ProcError::TaskDir(e)
    })?;

    let mut pid_map = PidMap::default();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let Ok(pid) = name.parse::<i32>() else { continue };
        if let Some(nspid) = scan_task_status(dir, name)? {
            pid_map.entries.push((nspid, pid));
        }
    }
    Ok(pid_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, ProcDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ProcDir::open(tmp.path()).unwrap();
        (tmp, dir)
    }

    #[test]
    fn test_procdir_rejects_files() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, "x").unwrap();
        assert!(ProcDir::open(&file).is_err());
        assert!(ProcDir::open(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_parse_maps_line_filters() {
        let keep = "55d000000000-55d000001000 r-xp 00000000 08:01 131 /usr/bin/vi";
        let mapping = parse_maps_line(keep).unwrap();
        assert_eq!(mapping.addr, 0x55d000000000);
        assert_eq!(mapping.file, "/usr/bin/vi");

        // Not executable.
        assert!(parse_maps_line(
            "55d000000000-55d000001000 r--p 00000000 08:01 131 /usr/bin/vi"
        )
        .is_none());
        // Anonymous and pseudo mappings have no absolute path.
        assert!(parse_maps_line("7fff0000-7fff1000 r-xp 00000000 00:00 0").is_none());
        assert!(parse_maps_line("7fff0000-7fff1000 r-xp 00000000 00:00 0 [vdso]").is_none());
    }

    #[test]
    fn test_parse_maps_line_path_with_spaces() {
        let line = "400000-401000 r-xp 00000000 08:01 99 /opt/my app/bin (deleted)";
        let mapping = parse_maps_line(line).unwrap();
        assert_eq!(mapping.file, "/opt/my app/bin (deleted)");
    }

    #[test]
    fn test_nspid_extraction_takes_last_field() {
        assert_eq!(parse_nspid_line("NSpid:\t1234\t17"), Some(17));
        assert_eq!(parse_nspid_line("NSpid:\t1234"), Some(1234));
        assert_eq!(parse_nspid_line("NSpid:\t12x"), None);
    }

    #[test]
    fn test_read_proc_info_builds_pid_map() {
        let (tmp, dir) = fixture();
        let task = tmp.path().join("task");
        fs::create_dir_all(task.join("100")).unwrap();
        fs::create_dir_all(task.join("101")).unwrap();
        fs::write(task.join("100/status"), "Name:\tvi\nNSpid:\t100\t5\n").unwrap();
        fs::write(task.join("101/status"), "Name:\tvi\nNSpid:\t101\t6\n").unwrap();
        fs::write(tmp.path().join("maps"), "400000-401000 r-xp 0 08:01 1 /bin/vi\n").unwrap();

        let mut config = Config::default();
        config.proc.exe = Some("/bin/vi".to_string());
        let map = read_proc_info(&dir, &mut config).unwrap();
        assert_eq!(map.map(5), 100);
        assert_eq!(map.map(6), 101);
        assert_eq!(config.proc.maps.len(), 1);
    }

    #[test]
    fn test_read_proc_info_skips_unreadable_task() {
        let (tmp, dir) = fixture();
        let task = tmp.path().join("task");
        fs::create_dir_all(task.join("100")).unwrap();
        // No status file for 100: skipped, not fatal.
        fs::create_dir_all(task.join("101")).unwrap();
        fs::write(task.join("101/status"), "NSpid:\t101\n").unwrap();

        let mut config = Config::default();
        config.proc.exe = Some("/bin/vi".to_string());
        config.proc.maps.push(Mapping {
            addr: 0,
            file: "/bin/vi".to_string(),
        });
        let map = read_proc_info(&dir, &mut config).unwrap();
        assert_eq!(map.map(101), 101);
    }

    #[test]
    fn test_read_proc_info_malformed_nspid_aborts() {
        let (tmp, dir) = fixture();
        let task = tmp.path().join("task");
        fs::create_dir_all(task.join("100")).unwrap();
        fs::write(task.join("100/status"), "NSpid:\tgarbage\n").unwrap();

        let mut config = Config::default();
        config.proc.exe = Some("/bin/vi".to_string());
        config.proc.maps.push(Mapping {
            addr: 0,
            file: "/bin/vi".to_string(),
        });
        assert!(matches!(
            read_proc_info(&dir, &mut config),
            Err(ProcError::MalformedNspid(_))
        ));
    }

    #[test]
    fn test_pid_map_identity_for_host_ids() {
        let map = PidMap {
            entries: vec![(5, 100)],
        };
        assert_eq!(map.map(5), 100);
        // Already host-visible: passes through.
        assert_eq!(map.map(100), 100);
        // Unknown: identity.
        assert_eq!(map.map(42), 42);
    }

    #[test]
    fn test_exe_link_not_overwritten() {
        let (tmp, dir) = fixture();
        fs::create_dir_all(tmp.path().join("task")).unwrap();
        let mut config = Config::default();
        config.proc.exe = Some("/configured/exe".to_string());
        config.proc.maps.push(Mapping {
            addr: 0,
            file: "/configured/exe".to_string(),
        });
        read_proc_info(&dir, &mut config).unwrap();
        assert_eq!(config.proc.exe.as_deref(), Some("/configured/exe"));
    }
}
