//! GPU device discovery and per-device process lists.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use pody_common::error::{PodyError, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// A compute process running on a GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    /// Host PID.
    pub pid: u32,
    /// Device memory held by the process, in bytes.
    pub gpu_memory_used: u64,
}

/// Driver and toolkit versions reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// GPU driver version.
    pub driver_version: Option<String>,
    /// Container toolkit version.
    pub toolkit_version: Option<String>,
}

/// Source of GPU device information.
pub trait DeviceQuery: Send + Sync {
    /// Indices of every device on the host.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeFailure` if the driver cannot be queried.
    fn device_ids(&self) -> Result<Vec<u32>>;

    /// Compute processes per device, for the requested devices only.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeFailure` if the driver cannot be queried.
    fn process_list(&self, ids: &[u32]) -> Result<BTreeMap<u32, Vec<GpuProcess>>>;

    /// Driver and toolkit versions.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeFailure` if the driver cannot be queried.
    fn spec(&self) -> Result<DeviceSpec>;
}

/// Queries NVIDIA devices through `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: PathBuf,
    toolkit: Option<PathBuf>,
}

impl NvidiaSmi {
    /// Locates `nvidia-smi` (and optionally `nvidia-ctk`) in `PATH`.
    #[must_use]
    pub fn detect() -> Option<Self> {
        let binary = which::which("nvidia-smi").ok()?;
        Some(Self {
            binary,
            toolkit: which::which("nvidia-ctk").ok(),
        })
    }

    fn query(&self, args: &[&str]) -> Result<String> {
        run(&self.binary, args)
    }
}

fn run(binary: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .map_err(|e| PodyError::Io {
            path: binary.to_path_buf(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(PodyError::runtime(format!(
            "{} failed: {}",
            binary.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl DeviceQuery for NvidiaSmi {
    fn device_ids(&self) -> Result<Vec<u32>> {
        let out = self.query(&["--query-gpu=index", "--format=csv,noheader,nounits"])?;
        Ok(parse_indices(&out))
    }

    fn process_list(&self, ids: &[u32]) -> Result<BTreeMap<u32, Vec<GpuProcess>>> {
        let gpus = self.query(&["--query-gpu=index,uuid", "--format=csv,noheader,nounits"])?;
        let apps = self.query(&[
            "--query-compute-apps=gpu_uuid,pid,used_memory",
            "--format=csv,noheader,nounits",
        ])?;
        Ok(parse_compute_apps(&gpus, &apps, ids))
    }

    fn spec(&self) -> Result<DeviceSpec> {
        let driver = self.query(&["--query-gpu=driver_version", "--format=csv,noheader"])?;
        let toolkit = self
            .toolkit
            .as_deref()
            .and_then(|ctk| run(ctk, &["--version"]).ok())
            .and_then(|out| out.lines().next().map(str::trim).map(str::to_string));
        Ok(DeviceSpec {
            driver_version: driver.lines().next().map(str::trim).map(str::to_string),
            toolkit_version: toolkit,
        })
    }
}

fn parse_indices(out: &str) -> Vec<u32> {
    out.lines().filter_map(|l| l.trim().parse().ok()).collect()
}

/// Joins the `index,uuid` table with the compute-apps table.
fn parse_compute_apps(gpus: &str, apps: &str, ids: &[u32]) -> BTreeMap<u32, Vec<GpuProcess>> {
    let by_uuid: HashMap<&str, u32> = gpus
        .lines()
        .filter_map(|l| {
            let (index, uuid) = l.split_once(',')?;
            Some((uuid.trim(), index.trim().parse().ok()?))
        })
        .collect();

    let mut table: BTreeMap<u32, Vec<GpuProcess>> = ids.iter().map(|id| (*id, Vec::new())).collect();
    for line in apps.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [uuid, pid, used] = fields[..] else {
            continue;
        };
        let Some(index) = by_uuid.get(uuid) else {
            continue;
        };
        let (Some(procs), Ok(pid)) = (table.get_mut(index), pid.parse::<u32>()) else {
            continue;
        };
        procs.push(GpuProcess {
            pid,
            gpu_memory_used: used.parse::<u64>().unwrap_or(0) * MIB,
        });
    }
    table
}

/// Fixed device set for tests and GPU-less hosts.
#[derive(Debug, Default)]
pub struct StaticDevices {
    ids: Vec<u32>,
    processes: Mutex<BTreeMap<u32, Vec<GpuProcess>>>,
    spec: DeviceSpec,
}

impl StaticDevices {
    /// Devices with the given indices and no processes.
    #[must_use]
    pub fn new(ids: Vec<u32>) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    /// Sets the reported driver and toolkit versions.
    #[must_use]
    pub fn with_spec(mut self, spec: DeviceSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Replaces the process list of device `id`.
    pub fn set_processes(&self, id: u32, procs: Vec<GpuProcess>) {
        if let Ok(mut table) = self.processes.lock() {
            let _ = table.insert(id, procs);
        }
    }
}

impl DeviceQuery for StaticDevices {
    fn device_ids(&self) -> Result<Vec<u32>> {
        Ok(self.ids.clone())
    }

    fn process_list(&self, ids: &[u32]) -> Result<BTreeMap<u32, Vec<GpuProcess>>> {
        let table = self
            .processes
            .lock()
            .map_err(|_| PodyError::runtime("device table lock poisoned"))?;
        Ok(ids
            .iter()
            .filter(|id| self.ids.contains(*id))
            .map(|id| (*id, table.get(id).cloned().unwrap_or_default()))
            .collect())
    }

    fn spec(&self) -> Result<DeviceSpec> {
        Ok(self.spec.clone())
    }
}

/// `nvidia-smi` when installed, otherwise an empty device set.
#[must_use]
pub fn detect_devices() -> Arc<dyn DeviceQuery> {
    match NvidiaSmi::detect() {
        Some(smi) => {
            tracing::info!(binary = %smi.binary.display(), "using nvidia-smi for device queries");
            Arc::new(smi)
        }
        None => {
            tracing::info!("nvidia-smi not found, no GPU devices available");
            Arc::new(StaticDevices::new(Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_skip_garbage() {
        assert_eq!(parse_indices("0\n1\n\nNo devices\n3\n"), vec![0, 1, 3]);
    }

    #[test]
    fn compute_apps_are_keyed_by_index() {
        let gpus = "0, GPU-aaa\n1, GPU-bbb\n";
        let apps = "GPU-bbb, 4242, 1024\nGPU-aaa, 17, 10\nGPU-zzz, 1, 1\nbroken line\n";
        let table = parse_compute_apps(gpus, apps, &[1]);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table[&1],
            vec![GpuProcess {
                pid: 4242,
                gpu_memory_used: 1024 * MIB
            }]
        );
    }

    #[test]
    fn requested_devices_without_processes_are_present() {
        let table = parse_compute_apps("0, GPU-aaa\n", "", &[0]);
        assert_eq!(table[&0], Vec::new());
    }

    #[test]
    fn static_devices_filter_unknown_ids() {
        let devices = StaticDevices::new(vec![0, 1]);
        devices.set_processes(
            1,
            vec![GpuProcess {
                pid: 9,
                gpu_memory_used: 5,
            }],
        );
        let table = devices.process_list(&[1, 7]).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[&1][0].pid, 9);
        assert_eq!(devices.device_ids().unwrap(), vec![0, 1]);
    }
}
