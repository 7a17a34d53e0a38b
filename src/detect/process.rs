//! Locating the FPM master process

use std::path::PathBuf;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::error::{Error, Result};

/// Snapshot of one OS process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable name as reported by the kernel
    pub name: String,
    /// Resolved executable path, when readable
    pub exe: Option<PathBuf>,
    /// Command line as currently visible
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    /// Command line that starts this process again.
    ///
    /// An FPM master rewrites its title to
    /// `php-fpm: master process (/etc/php/8.2/fpm/php-fpm.conf)`, which is not
    /// executable as-is. In that case the executable path and the
    /// configuration file in parentheses are used instead.
    pub fn invocation(&self) -> Option<Vec<String>> {
        let first = self.cmdline.first()?;

        if let Some(rest) = first.split_once(": master process").map(|(_, rest)| rest) {
            let program = self
                .exe
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| self.name.clone());
            let mut args = vec![program];
            let conf = rest
                .trim()
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .filter(|s| !s.is_empty());
            if let Some(conf) = conf {
                args.push("--fpm-config".to_string());
                args.push(conf.to_string());
            }
            return Some(args);
        }

        Some(self.cmdline.clone())
    }
}

/// Anything that can list the processes of a host
pub trait ProcessSource {
    fn processes(&self) -> Vec<ProcessInfo>;
}

/// The live process table, read through `sysinfo`
pub struct SystemProcesses;

impl ProcessSource for SystemProcesses {
    fn processes(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_exe(UpdateKind::OnlyIfNotSet),
        );

        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
                exe: process.exe().map(|p| p.to_path_buf()),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().to_string())
                    .collect(),
            })
            .collect()
    }
}

/// Pick the FPM process whose name contains `marker`.
///
/// Candidates are ordered by PID so that the oldest master wins when
/// several pools run side by side.
pub fn locate(source: &dyn ProcessSource, marker: &str) -> Result<ProcessInfo> {
    let mut processes = source.processes();
    processes.sort_by_key(|p| p.pid);
    processes
        .into_iter()
        .find(|p| p.name.contains(marker))
        .ok_or(Error::ProcessNotFound)
}

/// Look up a single process by PID
pub fn find(source: &dyn ProcessSource, pid: u32) -> Result<ProcessInfo> {
    source
        .processes()
        .into_iter()
        .find(|p| p.pid == pid)
        .ok_or(Error::ProcessNotFound)
}
