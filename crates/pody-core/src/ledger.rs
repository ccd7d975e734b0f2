//! Resource ledger: the single source of truth for pod ownership and
//! resource assignment.
//!
//! Creating a pod is a two-phase operation. [`Ledger::reserve`] checks
//! every quota and allocates GPUs and host ports in one locked
//! transaction, counting reservations that are still in flight (including
//! those of other processes sharing the data directory). The returned
//! [`Reservation`] is either turned into a registered pod with
//! [`Ledger::register`] or released when dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use pody_common::error::{PodyError, QuotaResource, Result};
use pody_common::quota::{Limit, Quota};
use pody_common::types::{ContainerId, PodName, PodStatus, PortMapping};
use pody_runtime::devices::DeviceQuery;
use pody_runtime::process::ProcessTable;
use serde::{Deserialize, Serialize};

use crate::state::{self, LedgerState, PendingClaim};

/// A registered pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// Full pod name.
    pub name: String,
    /// Owning username.
    pub owner: String,
    /// Instance tag.
    pub instance: String,
    /// Engine container id.
    pub container_id: ContainerId,
    /// Last known status.
    pub status: PodStatus,
    /// Image the pod was created from.
    pub image: String,
    /// Host to container port bindings.
    pub port_mapping: Vec<PortMapping>,
    /// GPU devices held by the pod.
    pub gpu_ids: Vec<u32>,
    /// Reserved memory.
    pub memory_limit: Limit,
    /// Reserved shared memory.
    pub shm_size: Limit,
    /// Reserved writable storage.
    pub storage_size: Limit,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Resources requested for a new pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Pod name; its owner is charged.
    pub name: PodName,
    /// Source image.
    pub image: String,
    /// Number of GPU devices.
    pub gpu_count: u32,
    /// Container ports that each need a host port.
    pub container_ports: Vec<u16>,
    /// Memory limit.
    pub memory_limit: Limit,
    /// Shared-memory size.
    pub shm_size: Limit,
    /// Writable storage size.
    pub storage_size: Limit,
}

/// Resources currently held by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Registered pods.
    pub pod_count: usize,
    /// GPU devices held across all pods.
    pub gpu_ids_in_use: Vec<u32>,
    /// Sum of memory reservations; unlimited if any pod is uncapped.
    pub memory_reserved: Limit,
}

/// Consistent copy of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Mutation counter; two equal versions hold identical pods.
    pub version: u64,
    /// Pods ordered by name.
    pub pods: Vec<Pod>,
}

/// A process running on a GPU, attributed to a pod where possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcessView {
    /// Host PID.
    pub pid: u32,
    /// Pod running the process, if it belongs to one.
    pub pod: Option<String>,
    /// Command line.
    pub cmd: String,
    /// Seconds since the process started.
    pub uptime: f64,
    /// Resident host memory in bytes.
    pub memory_used: u64,
    /// Device memory in bytes.
    pub gpu_memory_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    version: u64,
    pods: BTreeMap<String, Pod>,
    pending: BTreeMap<String, PendingClaim>,
}

impl Inner {
    /// Replaces the cached state with what is on disk, dropping claims
    /// whose creating process has gone away.
    fn replace(&mut self, loaded: LedgerState) {
        self.version = loaded.version;
        self.pods = loaded.pods.into_iter().map(|p| (p.name.clone(), p)).collect();
        self.pending = loaded
            .pending
            .into_iter()
            .filter(|c| {
                let live = c.is_live();
                if !live {
                    tracing::warn!(pod = %c.name, holder = c.holder, "dropping stale reservation");
                }
                live
            })
            .map(|c| (c.name.clone(), c))
            .collect();
    }

    fn owned_by<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a Pod> + 'a {
        self.pods.values().filter(move |p| p.owner == owner)
    }

    fn gpus_in_use(&self) -> BTreeSet<u32> {
        self.pods
            .values()
            .flat_map(|p| p.gpu_ids.iter().copied())
            .chain(self.pending.values().flat_map(|h| h.gpu_ids.iter().copied()))
            .collect()
    }

    fn ports_in_use(&self) -> BTreeSet<u16> {
        self.pods
            .values()
            .flat_map(|p| p.port_mapping.iter().map(|m| m.host_port))
            .chain(self.pending.values().flat_map(|h| h.host_ports.iter().copied()))
            .collect()
    }

    fn to_state(&self) -> LedgerState {
        LedgerState {
            version: self.version,
            pods: self.pods.values().cloned().collect(),
            pending: self.pending.values().cloned().collect(),
        }
    }
}

/// A quota-checked allocation that has not been registered yet.
///
/// Dropping an unregistered reservation gives its GPUs, ports, and pod
/// slot back.
#[derive(Debug)]
pub struct Reservation<'a> {
    ledger: &'a Ledger,
    claim: Claim,
    gpu_ids: Vec<u32>,
    port_mapping: Vec<PortMapping>,
    registered: bool,
}

impl Reservation<'_> {
    /// Pod name being created.
    #[must_use]
    pub fn name(&self) -> &PodName {
        &self.claim.name
    }

    /// Allocated GPU devices.
    #[must_use]
    pub fn gpu_ids(&self) -> &[u32] {
        &self.gpu_ids
    }

    /// Allocated host port bindings.
    #[must_use]
    pub fn port_mapping(&self) -> &[PortMapping] {
        &self.port_mapping
    }

    /// The claim this reservation satisfies.
    #[must_use]
    pub fn claim(&self) -> &Claim {
        &self.claim
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.registered {
            return;
        }
        let name = self.claim.name.to_string();
        match self.ledger.transact(|inner| Ok(((), inner.pending.remove(&name).is_some()))) {
            Ok(()) => tracing::debug!(pod = %name, "reservation released"),
            // The claim stays on disk until this process exits.
            Err(e) => tracing::error!(pod = %name, error = %e, "failed to release reservation"),
        }
    }
}

/// The resource ledger.
///
/// A persisted ledger treats its state file as the authority: every
/// operation takes the file lock, reloads, and (for mutations) saves
/// before the lock is released, so services in separate processes can
/// share one data directory.
#[derive(Debug)]
pub struct Ledger {
    inner: Mutex<Inner>,
    gpu_pool: Vec<u32>,
    port_pool: Vec<u16>,
    path: Option<PathBuf>,
}

impl Ledger {
    /// A ledger that is never persisted.
    #[must_use]
    pub fn in_memory(gpu_pool: Vec<u32>, port_pool: Vec<u16>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            gpu_pool,
            port_pool,
            path: None,
        }
    }

    /// Opens the ledger persisted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file exists but cannot be parsed.
    pub fn open(path: &Path, gpu_pool: Vec<u32>, port_pool: Vec<u16>) -> Result<Self> {
        let mut inner = Inner::default();
        {
            let _lock = state::lock(path, false)?;
            inner.replace(state::load_state(path)?);
        }
        tracing::info!(
            path = %path.display(),
            pods = inner.pods.len(),
            version = inner.version,
            "ledger loaded"
        );
        Ok(Self {
            inner: Mutex::new(inner),
            gpu_pool,
            port_pool,
            path: Some(path.to_path_buf()),
        })
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one mutation. `f` returns its output and whether it changed
    /// anything; changes bump the version and, for a persisted ledger, are
    /// saved while the file lock is still held.
    fn transact<T>(&self, f: impl FnOnce(&mut Inner) -> Result<(T, bool)>) -> Result<T> {
        let mut inner = self.guard();
        let Some(path) = &self.path else {
            let (out, changed) = f(&mut inner)?;
            if changed {
                inner.version += 1;
            }
            return Ok(out);
        };
        let _lock = state::lock(path, true)?;
        inner.replace(state::load_state(path)?);
        let (out, changed) = f(&mut inner)?;
        if changed {
            inner.version += 1;
            state::save_state(path, &inner.to_state())?;
        }
        Ok(out)
    }

    /// Runs a read against fresh state. If the file cannot be read the
    /// last loaded copy is used.
    fn view<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        let mut inner = self.guard();
        if let Some(path) = &self.path {
            let reloaded = state::lock(path, false).and_then(|_lock| state::load_state(path));
            match reloaded {
                Ok(loaded) => inner.replace(loaded),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "serving cached ledger"),
            }
        }
        f(&inner)
    }

    /// GPU devices the ledger allocates from.
    #[must_use]
    pub fn gpu_pool(&self) -> &[u32] {
        &self.gpu_pool
    }

    /// Checks `claim` against `quota` and allocates its GPUs and ports.
    ///
    /// # Errors
    ///
    /// Returns `NameConflict` if the pod exists or is being created, and
    /// `QuotaExceeded` if the owner's quota or the shared device and port
    /// pools cannot satisfy the claim. Persisted ledgers also fail when the
    /// state file cannot be locked, read, or written.
    pub fn reserve(&self, claim: Claim, quota: &Quota) -> Result<Reservation<'_>> {
        quota.memory_limit.check_cap(claim.memory_limit, QuotaResource::Memory)?;
        quota.shm_size.check_cap(claim.shm_size, QuotaResource::SharedMemory)?;
        quota.storage_size.check_cap(claim.storage_size, QuotaResource::Storage)?;

        let name = claim.name.to_string();
        let owner = claim.name.owner().to_string();
        let (gpu_ids, port_mapping) = self.transact(|inner| {
            if inner.pods.contains_key(&name) || inner.pending.contains_key(&name) {
                return Err(PodyError::NameConflict { name: name.clone() });
            }

            let pending_of_owner: Vec<&PendingClaim> =
                inner.pending.values().filter(|h| h.owner == owner).collect();
            let pods = inner.owned_by(&owner).count() + pending_of_owner.len();
            if !quota.max_pods.allows(u64::try_from(pods + 1).unwrap_or(u64::MAX)) {
                return Err(PodyError::quota(
                    QuotaResource::Pods,
                    format!("{owner} already has {pods} pods, limit is {}", quota.max_pods),
                ));
            }

            let gpus_held = inner.owned_by(&owner).map(|p| p.gpu_ids.len()).sum::<usize>()
                + pending_of_owner.iter().map(|h| h.gpu_ids.len()).sum::<usize>();
            let gpus_after = u64::try_from(gpus_held).unwrap_or(u64::MAX) + u64::from(claim.gpu_count);
            if !quota.gpu_count.allows(gpus_after) {
                return Err(PodyError::quota(
                    QuotaResource::Gpus,
                    format!(
                        "{owner} holds {gpus_held} GPUs and requested {}, limit is {}",
                        claim.gpu_count, quota.gpu_count
                    ),
                ));
            }

            let used_gpus = inner.gpus_in_use();
            let gpu_ids: Vec<u32> = self
                .gpu_pool
                .iter()
                .copied()
                .filter(|g| !used_gpus.contains(g))
                .take(claim.gpu_count as usize)
                .collect();
            if gpu_ids.len() < claim.gpu_count as usize {
                return Err(PodyError::quota(
                    QuotaResource::Gpus,
                    format!(
                        "requested {} GPUs, only {} free on this host",
                        claim.gpu_count,
                        gpu_ids.len()
                    ),
                ));
            }

            let used_ports = inner.ports_in_use();
            let mut free_ports = self.port_pool.iter().copied().filter(|p| !used_ports.contains(p));
            let mut port_mapping = Vec::with_capacity(claim.container_ports.len());
            for container_port in &claim.container_ports {
                let Some(host_port) = free_ports.next() else {
                    return Err(PodyError::quota(
                        QuotaResource::Ports,
                        format!("no free host port for container port {container_port}"),
                    ));
                };
                port_mapping.push(PortMapping {
                    host_port,
                    container_port: *container_port,
                });
            }

            let _ = inner.pending.insert(
                name.clone(),
                PendingClaim {
                    name: name.clone(),
                    owner: owner.clone(),
                    gpu_ids: gpu_ids.clone(),
                    host_ports: port_mapping.iter().map(|m| m.host_port).collect(),
                    holder: std::process::id(),
                },
            );
            Ok(((gpu_ids, port_mapping), true))
        })?;
        tracing::debug!(pod = %name, gpus = ?gpu_ids, ports = port_mapping.len(), "resources reserved");

        Ok(Reservation {
            ledger: self,
            claim,
            gpu_ids,
            port_mapping,
            registered: false,
        })
    }

    /// Turns a reservation into a registered pod.
    ///
    /// # Errors
    ///
    /// Returns an error if a persisted ledger cannot be saved; the
    /// reservation is released in that case.
    pub fn register(
        &self,
        mut reservation: Reservation<'_>,
        container_id: ContainerId,
        status: PodStatus,
    ) -> Result<Pod> {
        let claim = &reservation.claim;
        let pod = Pod {
            name: claim.name.to_string(),
            owner: claim.name.owner().to_string(),
            instance: claim.name.instance().to_string(),
            container_id,
            status,
            image: claim.image.clone(),
            port_mapping: reservation.port_mapping.clone(),
            gpu_ids: reservation.gpu_ids.clone(),
            memory_limit: claim.memory_limit,
            shm_size: claim.shm_size,
            storage_size: claim.storage_size,
            created_at: Utc::now(),
        };
        self.transact(|inner| {
            let _ = inner.pending.remove(&pod.name);
            let _ = inner.pods.insert(pod.name.clone(), pod.clone());
            Ok(((), true))
        })?;
        reservation.registered = true;
        tracing::info!(pod = %pod.name, owner = %pod.owner, gpus = ?pod.gpu_ids, "pod registered");
        Ok(pod)
    }

    /// Gives a reservation back explicitly.
    pub fn release(&self, reservation: Reservation<'_>) {
        drop(reservation);
    }

    /// Removes a pod and frees everything it held.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pods.
    pub fn deregister(&self, name: &str) -> Result<Pod> {
        let pod = self.transact(|inner| {
            let pod = inner.pods.remove(name).ok_or_else(|| PodyError::NotFound {
                kind: "pod",
                id: name.to_string(),
            })?;
            Ok((pod, true))
        })?;
        tracing::info!(pod = %name, "pod deregistered");
        Ok(pod)
    }

    /// Records a new status for a pod.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pods.
    pub fn set_status(&self, name: &str, status: PodStatus) -> Result<Pod> {
        self.transact(|inner| {
            let pod = inner.pods.get_mut(name).ok_or_else(|| PodyError::NotFound {
                kind: "pod",
                id: name.to_string(),
            })?;
            if pod.status == status {
                return Ok((pod.clone(), false));
            }
            tracing::debug!(pod = %name, from = %pod.status, to = %status, "pod status changed");
            pod.status = status;
            Ok((pod.clone(), true))
        })
    }

    /// A registered pod by full name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Pod> {
        self.view(|inner| inner.pods.get(name).cloned())
    }

    /// Pods of `owner`, ordered by name.
    #[must_use]
    pub fn pods_of(&self, owner: &str) -> Vec<Pod> {
        self.view(|inner| inner.owned_by(owner).cloned().collect())
    }

    /// Resources currently held by `owner`.
    #[must_use]
    pub fn current_usage(&self, owner: &str) -> Usage {
        self.view(|inner| {
            let mut gpu_ids_in_use = Vec::new();
            let mut memory = Some(0_u64);
            let mut pod_count = 0;
            for pod in inner.owned_by(owner) {
                pod_count += 1;
                gpu_ids_in_use.extend(pod.gpu_ids.iter().copied());
                memory = memory.zip(pod.memory_limit.value()).map(|(a, b)| a.saturating_add(b));
            }
            gpu_ids_in_use.sort_unstable();
            Usage {
                pod_count,
                gpu_ids_in_use,
                memory_reserved: memory.map_or(Limit::Unlimited, Limit::Limited),
            }
        })
    }

    /// Copies the whole ledger in one locked read.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.view(|inner| Snapshot {
            version: inner.version,
            pods: inner.pods.values().cloned().collect(),
        })
    }

    /// Processes on the given devices, attributed to pods.
    ///
    /// Processes that exit between the device query and the process-table
    /// lookup are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the device driver cannot be queried.
    pub fn gpu_processes(
        &self,
        gpu_ids: &[u32],
        devices: &dyn DeviceQuery,
        processes: &dyn ProcessTable,
    ) -> Result<BTreeMap<u32, Vec<GpuProcessView>>> {
        let snapshot = self.snapshot();
        let mut out = BTreeMap::new();
        for (gpu, procs) in devices.process_list(gpu_ids)? {
            let mut views = Vec::with_capacity(procs.len());
            for proc in procs {
                let info = match processes.query(proc.pid) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::debug!(pid = proc.pid, error = %e, "gpu process vanished");
                        continue;
                    }
                };
                let pod = info.container_id.as_deref().and_then(|cid| {
                    snapshot
                        .pods
                        .iter()
                        .find(|p| p.container_id.matches(cid))
                        .map(|p| p.name.clone())
                });
                views.push(GpuProcessView {
                    pid: proc.pid,
                    pod,
                    cmd: info.cmd,
                    uptime: info.uptime,
                    memory_used: info.memory_used,
                    gpu_memory_used: proc.gpu_memory_used,
                });
            }
            views.sort_by_key(|v| v.pid);
            let _ = out.insert(gpu, views);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use pody_runtime::devices::{GpuProcess, StaticDevices};
    use pody_runtime::process::{ProcessInfo, StaticProcessTable};

    use super::*;

    fn claim(owner: &str, instance: &str, gpus: u32, ports: &[u16]) -> Claim {
        Claim {
            name: PodName::new(None, owner, instance).unwrap(),
            image: "base:1".into(),
            gpu_count: gpus,
            container_ports: ports.to_vec(),
            memory_limit: Limit::Unlimited,
            shm_size: Limit::Unlimited,
            storage_size: Limit::Unlimited,
        }
    }

    fn quota(max_pods: u64, gpus: Limit) -> Quota {
        Quota {
            max_pods: Limit::Limited(max_pods),
            gpu_count: gpus,
            ..Quota::unlimited()
        }
    }

    #[test]
    fn reserve_register_allocates_lowest_free_resources() {
        let ledger = Ledger::in_memory(vec![0, 1, 2], vec![20000, 20001, 20002]);
        let r = ledger.reserve(claim("alice", "a", 2, &[22]), &quota(5, Limit::Unlimited)).unwrap();
        assert_eq!(r.gpu_ids(), &[0, 1]);
        let pod = ledger.register(r, ContainerId::new("c1"), PodStatus::Created).unwrap();
        assert_eq!(pod.port_mapping[0].host_port, 20000);

        let r = ledger.reserve(claim("bob", "a", 1, &[22, 8888]), &quota(5, Limit::Unlimited)).unwrap();
        assert_eq!(r.gpu_ids(), &[2]);
        assert_eq!(r.port_mapping()[1].host_port, 20002);
    }

    #[test]
    fn pod_quota_counts_pending_reservations() {
        let ledger = Ledger::in_memory(vec![], vec![]);
        let q = quota(1, Limit::Unlimited);
        let held = ledger.reserve(claim("alice", "a", 0, &[]), &q).unwrap();
        let err = ledger.reserve(claim("alice", "b", 0, &[]), &q).unwrap_err();
        assert!(matches!(
            err,
            PodyError::QuotaExceeded {
                resource: QuotaResource::Pods,
                ..
            }
        ));
        ledger.release(held);
        assert!(ledger.reserve(claim("alice", "b", 0, &[]), &q).is_ok());
    }

    #[test]
    fn dropped_reservation_frees_gpus() {
        let ledger = Ledger::in_memory(vec![0], vec![]);
        let q = quota(5, Limit::Unlimited);
        {
            let _r = ledger.reserve(claim("alice", "a", 1, &[]), &q).unwrap();
            assert!(ledger.reserve(claim("bob", "a", 1, &[]), &q).is_err());
        }
        assert!(ledger.reserve(claim("bob", "a", 1, &[]), &q).is_ok());
        assert_eq!(ledger.snapshot().pods.len(), 0);
    }

    #[test]
    fn gpu_quota_and_name_conflicts() {
        let ledger = Ledger::in_memory(vec![0, 1, 2, 3], vec![]);
        let q = quota(5, Limit::Limited(2));
        let r = ledger.reserve(claim("alice", "a", 2, &[]), &q).unwrap();
        let _ = ledger.register(r, ContainerId::new("c1"), PodStatus::Created).unwrap();

        assert!(matches!(
            ledger.reserve(claim("alice", "b", 1, &[]), &q),
            Err(PodyError::QuotaExceeded { resource: QuotaResource::Gpus, .. })
        ));
        assert!(matches!(
            ledger.reserve(claim("alice", "a", 0, &[]), &q),
            Err(PodyError::NameConflict { .. })
        ));
    }

    #[test]
    fn per_pod_caps_are_enforced() {
        let ledger = Ledger::in_memory(vec![], vec![]);
        let q = Quota {
            memory_limit: Limit::Limited(1024),
            ..Quota::unlimited()
        };
        let mut c = claim("alice", "a", 0, &[]);
        c.memory_limit = Limit::Limited(2048);
        assert!(matches!(
            ledger.reserve(c, &q),
            Err(PodyError::QuotaExceeded { resource: QuotaResource::Memory, .. })
        ));
    }

    #[test]
    fn concurrent_reserves_never_exceed_quota() {
        let ledger = Arc::new(Ledger::in_memory(vec![], vec![]));
        let q = quota(3, Limit::Unlimited);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger
                        .reserve(claim("alice", &format!("p{i}"), 0, &[]), &q)
                        .and_then(|r| ledger.register(r, ContainerId::new(format!("c{i}")), PodStatus::Created))
                        .is_ok()
                })
            })
            .collect();
        let ok = handles.into_iter().filter_map(|h| h.join().ok()).filter(|ok| *ok).count();
        assert_eq!(ok, 3);
        assert_eq!(ledger.current_usage("alice").pod_count, 3);
    }

    #[test]
    fn usage_and_snapshot_versions() {
        let ledger = Ledger::in_memory(vec![0, 1], vec![]);
        let q = Quota::unlimited();
        let mut c = claim("alice", "a", 1, &[]);
        c.memory_limit = Limit::Limited(100);
        let r = ledger.reserve(c, &q).unwrap();
        let _ = ledger.register(r, ContainerId::new("c1"), PodStatus::Created).unwrap();
        let v1 = ledger.snapshot().version;

        let usage = ledger.current_usage("alice");
        assert_eq!(usage.pod_count, 1);
        assert_eq!(usage.gpu_ids_in_use, vec![0]);
        assert_eq!(usage.memory_reserved, Limit::Limited(100));

        let _ = ledger.set_status("alice-a", PodStatus::Running).unwrap();
        assert!(ledger.snapshot().version > v1);
        let _ = ledger.deregister("alice-a").unwrap();
        assert!(matches!(ledger.deregister("alice-a"), Err(PodyError::NotFound { .. })));
        assert_eq!(ledger.current_usage("alice").memory_reserved, Limit::Limited(0));
    }

    #[test]
    fn ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        {
            let ledger = Ledger::open(&path, vec![0], vec![20000]).unwrap();
            let r = ledger.reserve(claim("alice", "a", 1, &[22]), &Quota::unlimited()).unwrap();
            let _ = ledger.register(r, ContainerId::new("c1"), PodStatus::Running).unwrap();
        }
        let ledger = Ledger::open(&path, vec![0], vec![20000]).unwrap();
        let pod = ledger.get("alice-a").unwrap();
        assert_eq!(pod.gpu_ids, vec![0]);
        assert_eq!(pod.status, PodStatus::Running);
        assert!(ledger.reserve(claim("bob", "a", 1, &[]), &Quota::unlimited()).is_err());
    }

    #[test]
    fn ledgers_sharing_a_file_see_each_others_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let a = Ledger::open(&path, vec![0, 1], vec![]).unwrap();
        let b = Ledger::open(&path, vec![0, 1], vec![]).unwrap();

        let r = a.reserve(claim("alice", "y", 1, &[]), &Quota::unlimited()).unwrap();
        let _ = a.register(r, ContainerId::new("c1"), PodStatus::Running).unwrap();
        let r = b.reserve(claim("bob", "x", 1, &[]), &Quota::unlimited()).unwrap();
        assert_eq!(r.gpu_ids(), &[1]);
        let _ = b.register(r, ContainerId::new("c2"), PodStatus::Running).unwrap();

        // A mutation through `a` must not drop the pod `b` wrote.
        let _ = a.set_status("alice-y", PodStatus::Exited).unwrap();
        let _ = a.deregister("alice-y").unwrap();
        assert_eq!(a.get("bob-x").unwrap().gpu_ids, vec![1]);

        let c = Ledger::open(&path, vec![0, 1], vec![]).unwrap();
        assert_eq!(c.snapshot().pods.len(), 1);
        let r = c.reserve(claim("carol", "z", 1, &[]), &Quota::unlimited()).unwrap();
        assert_eq!(r.gpu_ids(), &[0]);
    }

    #[test]
    fn pending_reservations_are_visible_to_other_ledgers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let a = Ledger::open(&path, vec![0], vec![]).unwrap();
        let b = Ledger::open(&path, vec![0], vec![]).unwrap();

        let held = a.reserve(claim("alice", "a", 1, &[]), &Quota::unlimited()).unwrap();
        assert!(matches!(
            b.reserve(claim("bob", "a", 1, &[]), &Quota::unlimited()),
            Err(PodyError::QuotaExceeded { resource: QuotaResource::Gpus, .. })
        ));
        drop(held);
        assert!(b.reserve(claim("bob", "a", 1, &[]), &Quota::unlimited()).is_ok());
    }

    #[test]
    fn reservations_of_exited_processes_are_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let gone = child.id();
        let _ = child.wait().expect("wait");
        let orphaned = LedgerState {
            version: 3,
            pods: vec![],
            pending: vec![PendingClaim {
                name: "alice-a".into(),
                owner: "alice".into(),
                gpu_ids: vec![0],
                host_ports: vec![],
                holder: gone,
            }],
        };
        state::save_state(&path, &orphaned).unwrap();

        let ledger = Ledger::open(&path, vec![0], vec![]).unwrap();
        let r = ledger.reserve(claim("alice", "a", 1, &[]), &Quota::unlimited()).unwrap();
        assert_eq!(r.gpu_ids(), &[0]);
    }

    #[test]
    fn gpu_processes_are_attributed_to_pods() {
        let ledger = Ledger::in_memory(vec![0, 1], vec![]);
        let r = ledger.reserve(claim("alice", "a", 1, &[]), &Quota::unlimited()).unwrap();
        let _ = ledger.register(r, ContainerId::new("abcdef"), PodStatus::Running).unwrap();

        let devices = StaticDevices::new(vec![0, 1]);
        devices.set_processes(
            0,
            vec![
                GpuProcess { pid: 20, gpu_memory_used: 2048 },
                GpuProcess { pid: 10, gpu_memory_used: 1024 },
                GpuProcess { pid: 99, gpu_memory_used: 1 },
            ],
        );
        let table = StaticProcessTable::new();
        for (pid, container) in [(10, Some("abcdef")), (20, None)] {
            table.insert(ProcessInfo {
                pid,
                cmd: format!("proc{pid}"),
                container_id: container.map(str::to_string),
                uptime: 5.0,
                cpu_time: 1.0,
                memory_used: 64,
            });
        }

        let out = ledger.gpu_processes(&[0, 1], &devices, &table).unwrap();
        let gpu0 = &out[&0];
        assert_eq!(gpu0.len(), 2);
        assert_eq!(gpu0[0].pid, 10);
        assert_eq!(gpu0[0].pod.as_deref(), Some("alice-a"));
        assert_eq!(gpu0[1].pod, None);
        assert!(out[&1].is_empty());
    }
}
