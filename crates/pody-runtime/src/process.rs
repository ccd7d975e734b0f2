//! Host process table: CPU time, memory, and container membership of PIDs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::unistd::{SysconfVar, sysconf};
use pody_common::error::{PodyError, Result};
use serde::{Deserialize, Serialize};

/// Snapshot of one host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Host PID.
    pub pid: u32,
    /// Command line, arguments joined by spaces.
    pub cmd: String,
    /// Container the process belongs to, if any.
    pub container_id: Option<String>,
    /// Seconds since the process started.
    pub uptime: f64,
    /// Cumulative user + system CPU seconds.
    pub cpu_time: f64,
    /// Resident memory in bytes.
    pub memory_used: u64,
}

/// Source of host process information.
pub trait ProcessTable: Send + Sync {
    /// Looks up a single process.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the process does not exist.
    fn query(&self, pid: u32) -> Result<ProcessInfo>;

    /// Every process whose cgroup belongs to `container_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be scanned.
    fn container_processes(&self, container_id: &str) -> Result<Vec<ProcessInfo>>;
}

/// Reads the Linux `/proc` filesystem.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    clock_ticks: u64,
    page_size: u64,
}

impl ProcFs {
    /// Reads `/proc` with the host's clock-tick and page sizes.
    #[must_use]
    pub fn new() -> Self {
        let sys = |var, fallback: u64| {
            sysconf(var)
                .ok()
                .flatten()
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };
        Self::with_root("/proc", sys(SysconfVar::CLK_TCK, 100), sys(SysconfVar::PAGE_SIZE, 4096))
    }

    /// Reads a `/proc`-shaped tree rooted elsewhere.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>, clock_ticks: u64, page_size: u64) -> Self {
        Self {
            root: root.into(),
            clock_ticks,
            page_size,
        }
    }

    fn read(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(|e| PodyError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn system_uptime(&self) -> Result<f64> {
        let content = self.read(&self.root.join("uptime"))?;
        content
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| PodyError::runtime("malformed /proc/uptime"))
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    #[allow(clippy::cast_precision_loss)]
    fn query(&self, pid: u32) -> Result<ProcessInfo> {
        let dir = self.root.join(pid.to_string());
        if !dir.is_dir() {
            return Err(PodyError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        }
        let stat = parse_stat(&self.read(&dir.join("stat"))?)
            .ok_or_else(|| PodyError::runtime(format!("malformed stat for pid {pid}")))?;
        let resident = self
            .read(&dir.join("statm"))?
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let cmd = self
            .read(&dir.join("cmdline"))
            .map(|raw| {
                raw.split('\0')
                    .filter(|a| !a.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let container_id = self
            .read(&dir.join("cgroup"))
            .ok()
            .and_then(|c| container_id_from_cgroup(&c));

        let ticks = self.clock_ticks as f64;
        let uptime = (self.system_uptime()? - stat.start_ticks as f64 / ticks).max(0.0);
        Ok(ProcessInfo {
            pid,
            cmd,
            container_id,
            uptime,
            cpu_time: (stat.utime + stat.stime) as f64 / ticks,
            memory_used: resident * self.page_size,
        })
    }

    fn container_processes(&self, container_id: &str) -> Result<Vec<ProcessInfo>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| PodyError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let mut procs = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may exit between listing and reading.
            let Ok(info) = self.query(pid) else {
                continue;
            };
            if info
                .container_id
                .as_deref()
                .is_some_and(|id| id.starts_with(container_id) || container_id.starts_with(id))
            {
                procs.push(info);
            }
        }
        procs.sort_by_key(|p| p.pid);
        Ok(procs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stat {
    utime: u64,
    stime: u64,
    start_ticks: u64,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<Stat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |i: usize| fields.get(i).and_then(|v| v.parse::<u64>().ok());
    Some(Stat {
        utime: field(11)?,
        stime: field(12)?,
        start_ticks: field(19)?,
    })
}

/// Extracts a Docker container id from a `/proc/<pid>/cgroup` file.
///
/// Handles the systemd driver (`docker-<id>.scope`) and the cgroupfs
/// driver (`/docker/<id>`).
#[must_use]
pub fn container_id_from_cgroup(content: &str) -> Option<String> {
    let is_id = |s: &str| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit());
    for line in content.lines() {
        let path = line.rsplit(':').next().unwrap_or_default();
        let mut previous = "";
        for segment in path.split('/') {
            let scoped = segment
                .strip_prefix("docker-")
                .and_then(|s| s.strip_suffix(".scope"));
            if let Some(id) = scoped.filter(|s| is_id(s)) {
                return Some(id.to_string());
            }
            if previous == "docker" && is_id(segment) {
                return Some(segment.to_string());
            }
            previous = segment;
        }
    }
    None
}

/// In-memory process table for tests.
#[derive(Debug, Default)]
pub struct StaticProcessTable {
    procs: Mutex<BTreeMap<u32, ProcessInfo>>,
}

impl StaticProcessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a process.
    pub fn insert(&self, info: ProcessInfo) {
        if let Ok(mut procs) = self.procs.lock() {
            let _ = procs.insert(info.pid, info);
        }
    }

    /// Removes a process.
    pub fn remove(&self, pid: u32) {
        if let Ok(mut procs) = self.procs.lock() {
            let _ = procs.remove(&pid);
        }
    }
}

impl ProcessTable for StaticProcessTable {
    fn query(&self, pid: u32) -> Result<ProcessInfo> {
        self.procs
            .lock()
            .map_err(|_| PodyError::runtime("process table lock poisoned"))?
            .get(&pid)
            .cloned()
            .ok_or_else(|| PodyError::NotFound {
                kind: "process",
                id: pid.to_string(),
            })
    }

    fn container_processes(&self, container_id: &str) -> Result<Vec<ProcessInfo>> {
        let procs = self
            .procs
            .lock()
            .map_err(|_| PodyError::runtime("process table lock poisoned"))?;
        Ok(procs
            .values()
            .filter(|p| p.container_id.as_deref() == Some(container_id))
            .cloned()
            .collect())
    }
}
