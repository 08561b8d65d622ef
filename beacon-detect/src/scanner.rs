//! Incremental user-process scanner.
//!
//! Each pass enumerates the process table and reports the paths that
//! appeared and disappeared since the previous pass. A PID-keyed liveness
//! cache keeps repeat passes cheap: a PID seen before is only marked alive,
//! its path is never re-resolved. Deduplication of the reported diffs is by
//! path, not PID.

use std::collections::HashMap;
use std::io;
use tracing::debug;

struct CacheEntry {
    /// Resolved path; `None` memoizes "not interesting".
    path: Option<String>,
    alive: bool,
}

/// Process-table scanner with a liveness cache.
pub struct ProcessScanner {
    cache: HashMap<u32, CacheEntry>,
    #[cfg(not(target_os = "linux"))]
    system: sysinfo::System,
}

impl Default for ProcessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            #[cfg(not(target_os = "linux"))]
            system: sysinfo::System::new(),
        }
    }

    /// One pass over the process table: `(added, removed)` path diffs.
    #[cfg(target_os = "linux")]
    pub fn diff(&mut self) -> io::Result<(Vec<String>, Vec<String>)> {
        let mut pids = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                pids.push(pid);
            }
        }
        Ok(self.apply_scan(pids, resolve_linux))
    }

    /// One pass over the process table: `(added, removed)` path diffs.
    #[cfg(not(target_os = "linux"))]
    pub fn diff(&mut self) -> io::Result<(Vec<String>, Vec<String>)> {
        use sysinfo::{ProcessesToUpdate, UpdateKind};

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_user(UpdateKind::Always),
        );
        let current_user = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| self.system.process(pid))
            .and_then(|process| process.user_id().cloned());

        let mut processes: HashMap<u32, Option<String>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            let path = resolve_foreign(process, current_user.as_ref());
            processes.insert(pid.as_u32(), path);
        }
        let pids: Vec<u32> = processes.keys().copied().collect();
        Ok(self.apply_scan(pids, |pid| processes.get(&pid).cloned().flatten()))
    }

    /// Core diff step, independent of how processes are enumerated.
    ///
    /// `resolve` is only consulted for PIDs not in the cache.
    fn apply_scan(
        &mut self,
        pids: impl IntoIterator<Item = u32>,
        mut resolve: impl FnMut(u32) -> Option<String>,
    ) -> (Vec<String>, Vec<String>) {
        let mut added = Vec::new();
        for pid in pids {
            if let Some(entry) = self.cache.get_mut(&pid) {
                entry.alive = true;
                continue;
            }
            let path = resolve(pid);
            if let Some(path) = path.as_ref() {
                if !added.contains(path) {
                    added.push(path.clone());
                }
            }
            self.cache.insert(pid, CacheEntry { path, alive: true });
        }

        let mut removed = Vec::new();
        self.cache.retain(|_, entry| {
            if entry.alive {
                entry.alive = false;
                true
            } else {
                if let Some(path) = entry.path.take() {
                    if !removed.contains(&path) {
                        removed.push(path);
                    }
                }
                false
            }
        });

        if !added.is_empty() || !removed.is_empty() {
            debug!(added = added.len(), removed = removed.len(), "process diff");
        }
        (added, removed)
    }

    /// Forget everything; the next pass reports every live process as added.
    pub fn reset(&mut self) {
        self.cache.clear();
    }
}

/// Resolve a new Linux PID to a normalized path, or `None` when the process
/// is not a game candidate (system user, library helper, pathless argv).
#[cfg(target_os = "linux")]
fn resolve_linux(pid: u32) -> Option<String> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let uid: u32 = status
        .lines()
        .find(|line| line.starts_with("Uid:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    if uid < 1000 {
        return None;
    }
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = linux_argv0(&cmdline)?;
    sanitize_path(&argv0)
}

/// First argv element, truncated after a `.exe` fragment when one is present
/// (Wine command lines carry Windows arguments after the binary).
fn linux_argv0(cmdline: &[u8]) -> Option<String> {
    let argv0 = cmdline.split(|byte| *byte == 0).next()?;
    let argv0 = String::from_utf8_lossy(argv0).to_string();
    if argv0.is_empty() {
        return None;
    }
    let truncated = match argv0.find(".exe") {
        Some(position) => argv0[..position + 4].to_string(),
        None => argv0,
    };
    if truncated.starts_with("/usr/lib") || truncated.starts_with("bash") {
        return None;
    }
    Some(truncated)
}

/// Normalize separators and reject pathless entries.
fn sanitize_path(raw: &str) -> Option<String> {
    let path: String = raw.replace('\\', "/").replace('\0', "");
    path.contains('/').then_some(path)
}

/// Resolve a new PID on Windows/macOS from its sysinfo record.
#[cfg(not(target_os = "linux"))]
fn resolve_foreign(
    process: &sysinfo::Process,
    current_user: Option<&sysinfo::Uid>,
) -> Option<String> {
    // Keep only the current user's processes.
    match (process.user_id(), current_user) {
        (Some(user), Some(current)) if user == current => {}
        _ => return None,
    }
    let argv0 = process.cmd().first()?.to_str()?;
    #[cfg(target_os = "windows")]
    if argv0.contains(":\\Windows\\") || argv0.contains(":\\Program Files\\WindowsApps\\") {
        return None;
    }
    sanitize_path(argv0)
}
