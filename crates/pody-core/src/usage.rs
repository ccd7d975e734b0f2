//! Usage accounting.
//!
//! A sampler periodically records, for every process of every pod, its
//! cumulative CPU time and the GPUs it occupies. Records are appended to a
//! JSON-lines log and never rewritten; CPU and GPU time are aggregated
//! from that log over a time window. Processes that start and end between
//! two samples are not seen, so the figures are approximate.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pody_common::error::{PodyError, Result};
use pody_common::size::parse_span;
use pody_runtime::devices::DeviceQuery;
use pody_runtime::process::ProcessTable;
use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;

/// One sampled process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Pod owner.
    pub user: String,
    /// Host PID.
    pub pid: u32,
    /// Pod name.
    pub pod: String,
    /// GPU the process was running on, if any.
    pub gpu_id: Option<u32>,
    /// Cumulative CPU seconds of the process.
    pub cpu_time: f64,
    /// GPU seconds attributed to this sample.
    pub gpu_time: f64,
    /// Resident memory in bytes.
    pub memory_used: u64,
    /// Device memory in bytes.
    pub gpu_memory_used: u64,
    /// Unix timestamp of the sample.
    pub sampled_at: i64,
}

/// Users an aggregation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSelection {
    /// Every user present in the log.
    All,
    /// Only these users; each appears in the result, with 0 if idle.
    Only(BTreeSet<String>),
}

impl UserSelection {
    fn includes(&self, user: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(users) => users.contains(user),
        }
    }

    fn seed(&self) -> BTreeMap<String, f64> {
        match self {
            Self::All => BTreeMap::new(),
            Self::Only(users) => users.iter().map(|u| (u.clone(), 0.0)).collect(),
        }
    }
}

/// Parses a window start: an absolute unix timestamp, or a span such as
/// `1w` counted back from `now`.
///
/// # Errors
///
/// Returns `InvalidInput` for anything else.
pub fn parse_since(since: &str, now: i64) -> Result<i64> {
    let since = since.trim();
    if let Ok(ts) = since.parse::<i64>() {
        return Ok(ts);
    }
    let span = parse_span(since)?;
    let secs = i64::try_from(span.as_secs())
        .map_err(|_| PodyError::invalid(format!("time span {since:?} is too large")))?;
    Ok(now.saturating_sub(secs))
}

/// Append-only usage log.
#[derive(Debug, Clone)]
pub struct UsageLog {
    path: PathBuf,
}

impl UsageLog {
    /// Log stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends records, one JSON document per line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn append(&self, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PodyError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PodyError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        file.write_all(lines.as_bytes()).map_err(|e| PodyError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Every record in the log. Unparsable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read(&self) -> Result<Vec<UsageRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| PodyError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line = n + 1, error = %e, "skipping malformed usage record"),
            }
        }
        Ok(records)
    }
}

/// CPU seconds per user.
///
/// Each `(user, pod, pid)` series contributes its last cumulative value
/// inside the window minus its last value before the window.
#[must_use]
pub fn cpu_time(records: &[UsageRecord], users: &UserSelection, since: Option<i64>) -> BTreeMap<String, f64> {
    #[derive(Default)]
    struct Series {
        before: Option<(i64, f64)>,
        last: Option<(i64, f64)>,
    }

    let mut series: BTreeMap<(&str, &str, u32), Series> = BTreeMap::new();
    for r in records.iter().filter(|r| users.includes(&r.user)) {
        let entry = series.entry((r.user.as_str(), r.pod.as_str(), r.pid)).or_default();
        let slot = if since.is_some_and(|s| r.sampled_at < s) {
            &mut entry.before
        } else {
            &mut entry.last
        };
        if slot.is_none_or(|(at, _)| r.sampled_at >= at) {
            *slot = Some((r.sampled_at, r.cpu_time));
        }
    }

    let mut out = users.seed();
    for ((user, _, _), s) in series {
        let Some((_, last)) = s.last else {
            continue;
        };
        let base = s.before.map_or(0.0, |(_, v)| v);
        *out.entry(user.to_string()).or_default() += (last - base).max(0.0);
    }
    out
}

/// GPU seconds per user.
///
/// Records sharing `(user, sampled_at, gpu_id)` count once: several
/// processes of one user on one device at one instant occupy that device
/// once, while several devices at one instant add up.
#[must_use]
pub fn gpu_time(records: &[UsageRecord], users: &UserSelection, since: Option<i64>) -> BTreeMap<String, f64> {
    let mut groups: BTreeMap<(&str, i64, u32), f64> = BTreeMap::new();
    for r in records {
        let Some(gpu) = r.gpu_id else {
            continue;
        };
        if !users.includes(&r.user) || since.is_some_and(|s| r.sampled_at < s) {
            continue;
        }
        let slot = groups.entry((r.user.as_str(), r.sampled_at, gpu)).or_default();
        *slot = slot.max(r.gpu_time);
    }

    let mut out = users.seed();
    for ((user, _, _), secs) in groups {
        *out.entry(user.to_string()).or_default() += secs;
    }
    out
}

/// Produces usage records from the ledger, the process table, and the
/// device driver.
pub struct UsageSampler {
    interval: Duration,
}

impl std::fmt::Debug for UsageSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageSampler")
            .field("interval", &self.interval)
            .finish()
    }
}

impl UsageSampler {
    /// A sampler run every `interval`; each GPU sample is credited with
    /// that much GPU time.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Takes one sample at unix time `now`.
    ///
    /// A process on several GPUs yields one record per device. Pods whose
    /// processes cannot be listed are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the device driver cannot be queried.
    pub fn sample(
        &self,
        now: i64,
        ledger: &Ledger,
        processes: &dyn ProcessTable,
        devices: &dyn DeviceQuery,
    ) -> Result<Vec<UsageRecord>> {
        let mut on_gpu: BTreeMap<u32, Vec<(u32, u64)>> = BTreeMap::new();
        for (gpu, procs) in devices.process_list(ledger.gpu_pool())? {
            for p in procs {
                on_gpu.entry(p.pid).or_default().push((gpu, p.gpu_memory_used));
            }
        }

        let gpu_secs = self.interval.as_secs_f64();
        let mut records = Vec::new();
        for pod in ledger.snapshot().pods.into_iter().filter(|p| p.status.is_running()) {
            let procs = match processes.container_processes(pod.container_id.as_str()) {
                Ok(procs) => procs,
                Err(e) => {
                    tracing::warn!(pod = %pod.name, error = %e, "cannot list pod processes");
                    continue;
                }
            };
            for proc in procs {
                let base = UsageRecord {
                    user: pod.owner.clone(),
                    pid: proc.pid,
                    pod: pod.name.clone(),
                    gpu_id: None,
                    cpu_time: proc.cpu_time,
                    gpu_time: 0.0,
                    memory_used: proc.memory_used,
                    gpu_memory_used: 0,
                    sampled_at: now,
                };
                match on_gpu.get(&proc.pid) {
                    None => records.push(base),
                    Some(gpus) => records.extend(gpus.iter().map(|(gpu, mem)| UsageRecord {
                        gpu_id: Some(*gpu),
                        gpu_time: gpu_secs,
                        gpu_memory_used: *mem,
                        ..base.clone()
                    })),
                }
            }
        }
        tracing::debug!(records = records.len(), sampled_at = now, "usage sampled");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use pody_common::quota::{Limit, Quota};
    use pody_common::types::{ContainerId, PodName, PodStatus};
    use pody_runtime::devices::{GpuProcess, StaticDevices};
    use pody_runtime::process::{ProcessInfo, StaticProcessTable};

    use super::*;
    use crate::ledger::Claim;

    fn record(user: &str, pid: u32, gpu: Option<u32>, cpu: f64, gpu_secs: f64, at: i64) -> UsageRecord {
        UsageRecord {
            user: user.into(),
            pid,
            pod: format!("{user}-main"),
            gpu_id: gpu,
            cpu_time: cpu,
            gpu_time: gpu_secs,
            memory_used: 0,
            gpu_memory_used: 0,
            sampled_at: at,
        }
    }

    fn only(users: &[&str]) -> UserSelection {
        UserSelection::Only(users.iter().map(|u| (*u).to_string()).collect())
    }

    #[test]
    fn gpu_time_multiplies_across_devices() {
        let now = 1_000_000;
        let records = vec![
            record("alice", 10, Some(0), 0.0, 100.0, now - 200),
            record("alice", 11, Some(1), 0.0, 100.0, now - 200),
            // second process of the same user on device 0 at the same instant
            record("alice", 12, Some(0), 0.0, 100.0, now - 200),
            record("alice", 10, Some(0), 0.0, 50.0, now - 100),
            record("bob", 20, Some(2), 0.0, 60.0, now - 100),
        ];
        let since = parse_since("1w", now).unwrap();
        let out = gpu_time(&records, &only(&["alice"]), Some(since));
        assert_eq!(out.len(), 1);
        assert!((out["alice"] - 250.0).abs() < f64::EPSILON);

        let all = gpu_time(&records, &UserSelection::All, None);
        assert!((all["bob"] - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_time_subtracts_the_pre_window_baseline() {
        let records = vec![
            record("alice", 10, None, 5.0, 0.0, 100),
            record("alice", 10, None, 8.0, 0.0, 200),
            record("alice", 10, None, 20.0, 0.0, 300),
            record("alice", 11, None, 4.0, 0.0, 300),
        ];
        let out = cpu_time(&records, &only(&["alice", "carol"]), Some(150));
        assert!((out["alice"] - (20.0 - 5.0 + 4.0)).abs() < 1e-9);
        assert!(out["carol"].abs() < f64::EPSILON);

        let out = cpu_time(&records, &UserSelection::All, None);
        assert!((out["alice"] - 24.0).abs() < 1e-9);
    }

    #[test]
    fn since_accepts_spans_and_timestamps() {
        assert_eq!(parse_since("1700000000", 0).unwrap(), 1_700_000_000);
        assert_eq!(parse_since("2d", 200_000).unwrap(), 200_000 - 172_800);
        assert_eq!(parse_since("1y", 0).unwrap(), -365 * 86_400);
        assert!(parse_since("yesterday", 0).is_err());
    }

    #[test]
    fn log_appends_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = UsageLog::new(dir.path().join("usage.jsonl"));
        assert!(log.read().unwrap().is_empty());
        log.append(&[record("alice", 1, None, 1.0, 0.0, 1)]).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{broken\n")
            .unwrap();
        log.append(&[record("bob", 2, Some(0), 2.0, 60.0, 2)]).unwrap();

        let records = log.read().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].user, "bob");
    }

    #[test]
    fn sampler_attributes_processes_and_gpus() {
        let ledger = Ledger::in_memory(vec![0, 1], vec![]);
        let claim = Claim {
            name: PodName::new(None, "alice", "main").unwrap(),
            image: "base:1".into(),
            gpu_count: 2,
            container_ports: vec![],
            memory_limit: Limit::Unlimited,
            shm_size: Limit::Unlimited,
            storage_size: Limit::Unlimited,
        };
        let r = ledger.reserve(claim, &Quota::unlimited()).unwrap();
        let _ = ledger.register(r, ContainerId::new("cid"), PodStatus::Running);

        let table = StaticProcessTable::new();
        for pid in [10, 11] {
            table.insert(ProcessInfo {
                pid,
                cmd: "python".into(),
                container_id: Some("cid".into()),
                uptime: 1.0,
                cpu_time: 3.0,
                memory_used: 100,
            });
        }
        let devices = StaticDevices::new(vec![0, 1]);
        devices.set_processes(0, vec![GpuProcess { pid: 10, gpu_memory_used: 7 }]);
        devices.set_processes(1, vec![GpuProcess { pid: 10, gpu_memory_used: 9 }]);

        let sampler = UsageSampler::new(Duration::from_secs(60));
        let records = sampler.sample(500, &ledger, &table, &devices).unwrap();
        assert_eq!(records.len(), 3);
        let gpu_records: Vec<_> = records.iter().filter(|r| r.gpu_id.is_some()).collect();
        assert_eq!(gpu_records.len(), 2);
        assert!(gpu_records.iter().all(|r| r.pid == 10 && (r.gpu_time - 60.0).abs() < f64::EPSILON));

        let out = gpu_time(&records, &UserSelection::All, None);
        assert!((out["alice"] - 120.0).abs() < f64::EPSILON);
    }
}
