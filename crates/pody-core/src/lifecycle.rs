//! Pod lifecycle manager.
//!
//! Pods move through `absent -> created -> running -> stopped -> running
//! ... -> absent`. Every operation checks ownership and quotas before it
//! touches the engine, and mutating operations on one pod are serialized
//! by a per-pod lock so different pods never contend.

use std::sync::Arc;
use std::time::Duration;

use pody_common::config::PodyConfig;
use pody_common::error::{PodyError, QuotaResource, Result};
use pody_common::types::{PodName, PodRef, PodStatus};
use pody_common::user::User;
use pody_image::naming::CommitName;
use pody_image::registry::ImageRegistry;
use pody_runtime::backend::{ContainerRuntime, ContainerSpec};
use serde::{Deserialize, Serialize};

use crate::identity::UserStore;
use crate::ledger::{Claim, Ledger, Pod};
use crate::locks::KeyedLocks;

/// Optional resource request for `create`.
///
/// Missing memory, shm, and storage values default to the owner's
/// per-pod cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRequest {
    /// GPU devices to allocate.
    pub gpus: u32,
    /// Memory limit in bytes.
    pub memory: Option<u64>,
    /// Shared-memory size in bytes.
    pub shm: Option<u64>,
    /// Writable storage in bytes.
    pub storage: Option<u64>,
}

/// Result of a completed `exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit status of the command.
    pub exit_code: i32,
    /// Combined terminal output.
    pub log: String,
}

/// Result of a successful `commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// Image name as shown to the caller.
    pub image_name: String,
    /// Full engine reference.
    pub image: String,
    /// Engine output.
    pub log: String,
}

/// Settings the manager takes from [`PodyConfig`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Pod name prefix.
    pub prefix: Option<String>,
    /// Volume bindings applied to every pod.
    pub volumes: Vec<String>,
    /// Command run after every start.
    pub on_start: Option<String>,
    /// Default `exec` timeout.
    pub exec_timeout: Duration,
}

impl ManagerSettings {
    /// Extracts the lifecycle settings from `config`.
    #[must_use]
    pub fn from_config(config: &PodyConfig) -> Self {
        Self {
            prefix: config.name_prefix.clone().filter(|p| !p.is_empty()),
            volumes: config.volume_mappings.clone(),
            on_start: config.on_start.clone().filter(|c| !c.trim().is_empty()),
            exec_timeout: Duration::from_secs(config.default_exec_timeout_secs),
        }
    }
}

/// Orchestrates pods across the ledger, the image registry, and the
/// container engine.
pub struct PodManager {
    runtime: Arc<dyn ContainerRuntime>,
    ledger: Arc<Ledger>,
    images: Arc<ImageRegistry>,
    users: Arc<UserStore>,
    pod_locks: KeyedLocks,
    user_locks: KeyedLocks,
    settings: ManagerSettings,
}

impl std::fmt::Debug for PodManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodManager")
            .field("runtime", &self.runtime.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PodManager {
    /// Wires a manager over its collaborators.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ledger: Arc<Ledger>,
        images: Arc<ImageRegistry>,
        users: Arc<UserStore>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            runtime,
            ledger,
            images,
            users,
            pod_locks: KeyedLocks::new(),
            user_locks: KeyedLocks::new(),
            settings,
        }
    }

    /// Resolves an instance reference to a pod name the caller may act on.
    ///
    /// `<instance>` names the caller's own pod; `<user>-<instance>` (or
    /// the prefixed form) names another user's pod, which only admins may
    /// address.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for malformed references and `Forbidden`
    /// when a non-admin names someone else's pod.
    pub fn resolve_target(&self, caller: &User, reference: &str) -> Result<PodName> {
        let parsed = PodRef::parse(reference)?;
        if let Some(prefix) = parsed.prefix {
            if Some(prefix) != self.settings.prefix.as_deref() {
                return Err(PodyError::invalid(format!(
                    "pod name prefix {prefix:?} does not match this service"
                )));
            }
        }
        let owner = parsed.owner.unwrap_or(&caller.name);
        if !caller.can_act_for(owner) {
            return Err(PodyError::forbidden(format!(
                "pod {reference} belongs to another user"
            )));
        }
        PodName::new(self.settings.prefix.as_deref(), owner, parsed.instance)
    }

    /// The user charged for pods of `owner`.
    fn owner_of(&self, caller: &User, owner: &str) -> Result<User> {
        if caller.name == owner {
            return Ok(caller.clone());
        }
        self.users.get(owner)
    }

    fn pod(&self, name: &PodName) -> Result<Pod> {
        let name = name.to_string();
        self.ledger
            .get(&name)
            .ok_or(PodyError::NotFound { kind: "pod", id: name })
    }

    /// Reads the engine's status into the ledger and returns it.
    ///
    /// A pod the ledger recorded as stopped stays stopped when the engine
    /// reports its exited container. Engine failures other than a missing
    /// container keep the recorded status.
    fn refresh(&self, pod: &Pod) -> PodStatus {
        let observed = match self.runtime.inspect(&pod.container_id) {
            Ok(status) => match (pod.status, status.status) {
                (PodStatus::Stopped, PodStatus::Exited) => PodStatus::Stopped,
                (_, s) => s,
            },
            Err(PodyError::NotFound { .. }) => PodStatus::Missing,
            Err(e) => {
                tracing::warn!(pod = %pod.name, error = %e, "runtime inspect failed, using recorded status");
                return pod.status;
            }
        };
        if observed != pod.status {
            if let Err(e) = self.ledger.set_status(&pod.name, observed) {
                tracing::debug!(pod = %pod.name, error = %e, "pod vanished during refresh");
            }
        }
        observed
    }

    /// Creates a pod from `image` without starting it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or inadmissible images,
    /// `NameConflict` for a taken instance tag, `QuotaExceeded` when the
    /// owner's quota or the host's GPU and port pools cannot satisfy the
    /// request, and `Forbidden` for pods of other users.
    pub fn create(&self, caller: &User, reference: &str, image: &str, request: &PodRequest) -> Result<Pod> {
        let name = self.resolve_target(caller, reference)?;
        let owner = self.owner_of(caller, name.owner())?;
        let source = self.images.resolve_source(&owner, image)?;
        let quota = owner.quota;
        let claim = Claim {
            name: name.clone(),
            image: source.image.clone(),
            gpu_count: request.gpus,
            container_ports: source.ports,
            memory_limit: quota.memory_limit.resolve_request(request.memory, QuotaResource::Memory)?,
            shm_size: quota.shm_size.resolve_request(request.shm, QuotaResource::SharedMemory)?,
            storage_size: quota.storage_size.resolve_request(request.storage, QuotaResource::Storage)?,
        };

        let key = name.to_string();
        self.pod_locks.with(&key, || -> Result<Pod> {
            let reservation = self.ledger.reserve(claim, &quota)?;
            let claim = reservation.claim();
            let spec = ContainerSpec {
                name: key.clone(),
                image: claim.image.clone(),
                owner: owner.name.clone(),
                gpu_ids: reservation.gpu_ids().to_vec(),
                port_mapping: reservation.port_mapping().to_vec(),
                memory_limit: claim.memory_limit.value(),
                shm_size: claim.shm_size.value(),
                storage_size: claim.storage_size.value(),
                volumes: self.settings.volumes.clone(),
            };
            let container_id = self.runtime.create(&spec).inspect_err(|e| {
                tracing::warn!(pod = %key, error = %e, "container creation failed, releasing reservation");
            })?;
            let pod = self
                .ledger
                .register(reservation, container_id.clone(), PodStatus::Created)
                .inspect_err(|e| {
                    tracing::error!(pod = %key, error = %e, "could not record pod, removing its container");
                    if let Err(e) = self.runtime.delete(&container_id) {
                        tracing::warn!(pod = %key, error = %e, "orphaned container left behind");
                    }
                })?;
            tracing::info!(pod = %pod.name, image = %pod.image, by = %caller.name, "pod created");
            Ok(pod)
        })
    }

    /// Removes a pod and releases everything it held.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pods and `Forbidden` for pods of
    /// other users.
    pub fn delete(&self, caller: &User, reference: &str) -> Result<String> {
        let name = self.resolve_target(caller, reference)?;
        let key = name.to_string();
        self.pod_locks.with(&key, || -> Result<String> {
            let pod = self.pod(&name)?;
            match self.runtime.delete(&pod.container_id) {
                Ok(()) => {}
                Err(PodyError::NotFound { .. }) => {
                    tracing::warn!(pod = %key, "container already gone, dropping ledger entry");
                }
                Err(e) => return Err(e),
            }
            self.ledger.deregister(&key).map(drop)?;
            tracing::info!(pod = %key, by = %caller.name, "pod deleted");
            Ok(format!("pod {key} deleted"))
        })
    }

    fn start_locked(&self, pod: &Pod) -> Result<String> {
        let mut log = self.runtime.start(&pod.container_id)?;
        self.ledger.set_status(&pod.name, PodStatus::Running).map(drop)?;
        tracing::info!(pod = %pod.name, "pod started");

        if let Some(hook) = &self.settings.on_start {
            match self.runtime.exec(&pod.container_id, hook, self.settings.exec_timeout) {
                Ok(out) if out.exit_code == 0 && !out.truncated => log.push_str(&out.output),
                Ok(out) => {
                    tracing::warn!(pod = %pod.name, exit_code = out.exit_code, "on-start hook failed");
                    log.push_str(&out.output);
                }
                Err(e) => tracing::warn!(pod = %pod.name, error = %e, "on-start hook could not run"),
            }
        }
        Ok(log)
    }

    /// Starts a created or stopped pod and returns the tail of its log.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` for running pods and `RuntimeFailure` when
    /// the engine refuses to start the container.
    pub fn start(&self, caller: &User, reference: &str) -> Result<String> {
        let name = self.resolve_target(caller, reference)?;
        self.pod_locks.with(&name.to_string(), || -> Result<String> {
            let pod = self.pod(&name)?;
            if self.refresh(&pod).is_running() {
                return Err(PodyError::AlreadyRunning { pod: pod.name });
            }
            self.start_locked(&pod)
        })
    }

    /// Stops a running pod.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` when the pod is not running.
    pub fn stop(&self, caller: &User, reference: &str) -> Result<()> {
        let name = self.resolve_target(caller, reference)?;
        self.pod_locks.with(&name.to_string(), || -> Result<()> {
            let pod = self.pod(&name)?;
            if !self.refresh(&pod).is_running() {
                return Err(PodyError::NotRunning { pod: pod.name });
            }
            self.runtime.stop(&pod.container_id)?;
            self.ledger.set_status(&pod.name, PodStatus::Stopped).map(drop)?;
            tracing::info!(pod = %pod.name, "pod stopped");
            Ok(())
        })
    }

    /// Stops the pod if it is running, then starts it again.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeFailure` if the restart fails; the pod is then
    /// recorded as stopped.
    pub fn restart(&self, caller: &User, reference: &str) -> Result<String> {
        let name = self.resolve_target(caller, reference)?;
        self.pod_locks.with(&name.to_string(), || -> Result<String> {
            let pod = self.pod(&name)?;
            if self.refresh(&pod).is_running() {
                self.runtime.stop(&pod.container_id)?;
            }
            self.ledger.set_status(&pod.name, PodStatus::Stopped).map(drop)?;
            self.start_locked(&pod).map_err(|e| {
                tracing::error!(pod = %pod.name, error = %e, "restart failed, pod left stopped");
                if let Err(e) = self.ledger.set_status(&pod.name, PodStatus::Stopped) {
                    tracing::warn!(pod = %pod.name, error = %e, "could not record stopped status");
                }
                match e {
                    PodyError::RuntimeFailure { .. } => e,
                    other => PodyError::runtime(other.to_string()),
                }
            })
        })
    }

    /// Current view of a pod, reconciled with the engine.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pods and `Forbidden` for pods of
    /// other users.
    pub fn inspect(&self, caller: &User, reference: &str) -> Result<Pod> {
        let name = self.resolve_target(caller, reference)?;
        self.pod_locks.with(&name.to_string(), || -> Result<Pod> {
            let mut pod = self.pod(&name)?;
            pod.status = self.refresh(&pod);
            Ok(pod)
        })
    }

    /// Sorted pod names of `owner`, defaulting to the caller.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when a non-admin lists another user.
    pub fn list(&self, caller: &User, owner: Option<&str>) -> Result<Vec<String>> {
        let owner = owner.unwrap_or(&caller.name);
        if !caller.can_act_for(owner) {
            return Err(PodyError::forbidden("only admins may list other users' pods"));
        }
        Ok(self.ledger.pods_of(owner).into_iter().map(|p| p.name).collect())
    }

    /// Runs `/bin/bash -c command` as root inside a running pod.
    ///
    /// The call does not hold the pod lock, so a long command never
    /// blocks `stop` or `delete`.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` for stopped pods and `Timeout` when the command
    /// outlives `timeout` (its partial output is discarded).
    pub fn exec(&self, caller: &User, reference: &str, command: &str, timeout: Option<Duration>) -> Result<ExecResult> {
        let name = self.resolve_target(caller, reference)?;
        let pod = self.pod(&name)?;
        if !self.refresh(&pod).is_running() {
            return Err(PodyError::NotRunning { pod: pod.name });
        }
        let timeout = timeout.unwrap_or(self.settings.exec_timeout);
        tracing::debug!(pod = %pod.name, timeout_secs = timeout.as_secs(), "exec");
        let out = self.runtime.exec(&pod.container_id, command, timeout)?;
        if out.truncated {
            tracing::warn!(pod = %pod.name, timeout_secs = timeout.as_secs(), "exec timed out");
            return Err(PodyError::Timeout {
                operation: "exec".into(),
                seconds: timeout.as_secs(),
            });
        }
        Ok(ExecResult {
            exit_code: out.exit_code,
            log: out.output,
        })
    }

    /// Commits a pod to `<commit_name>:<owner>[-<tag>]`.
    ///
    /// Count and size quotas are checked under the owner's lock with a
    /// provisional reservation; the commit itself runs without it. The
    /// engine commits to a staging reference and the final tag only moves
    /// once the new image fits the size quota.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` when the owner's committed images are at
    /// their count or size limit, or when the new image pushes them over.
    pub fn commit(
        &self,
        caller: &User,
        reference: &str,
        tag: Option<&str>,
        message: Option<&str>,
    ) -> Result<CommitResult> {
        let name = self.resolve_target(caller, reference)?;
        let pod = self.pod(&name)?;
        let owner = self.owner_of(caller, name.owner())?;
        let commit_name = CommitName::new(&owner.name, tag)?;

        let reservation = self
            .user_locks
            .with(&owner.name, || self.images.reserve_commit(&owner, &commit_name))?;
        let image = reservation.image().to_string();
        tracing::info!(pod = %pod.name, image = %image, staging = %reservation.staging(), "committing pod");
        let info = self.runtime.commit(&pod.container_id, reservation.staging(), message)?;
        self.images.finish_commit(reservation, &owner, &info)?;

        let image_name = if caller.is_admin {
            image.clone()
        } else {
            commit_name.to_string()
        };
        Ok(CommitResult {
            image_name,
            image,
            log: format!("committed {} ({} bytes)", info.id, info.size),
        })
    }

    /// Refreshes every pod's status from the engine; returns how many
    /// changed.
    pub fn reconcile(&self) -> usize {
        let mut changed = 0;
        for pod in self.ledger.snapshot().pods {
            let status = self.pod_locks.with(&pod.name, || self.refresh(&pod));
            if status != pod.status {
                tracing::info!(pod = %pod.name, from = %pod.status, to = %status, "pod status reconciled");
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use pody_common::config::ImageConfig;
    use pody_common::quota::{Limit, Quota};
    use pody_runtime::backend::memory::{InMemoryRuntime, Op};

    use super::*;

    struct Fixture {
        runtime: Arc<InMemoryRuntime>,
        ledger: Arc<Ledger>,
        manager: PodManager,
        _dir: tempfile::TempDir,
    }

    fn user(name: &str, is_admin: bool, quota: Quota) -> User {
        User {
            name: name.into(),
            is_admin,
            quota,
        }
    }

    fn fixture(on_start: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(InMemoryRuntime::with_images(["base:1"]));
        let config = PodyConfig {
            images: vec![ImageConfig {
                name: "base:1".into(),
                ports: vec![22],
                description: String::new(),
            }],
            on_start: on_start.map(str::to_string),
            ..PodyConfig::default()
        };
        let users = Arc::new(UserStore::open(&dir.path().join("users.json"), Quota::default()).unwrap());
        let ledger = Arc::new(Ledger::in_memory(vec![0, 1], (20000..20010).collect()));
        let images = Arc::new(ImageRegistry::new(runtime.clone(), &config));
        let manager = PodManager::new(
            runtime.clone(),
            Arc::clone(&ledger),
            images,
            users,
            ManagerSettings::from_config(&config),
        );
        Fixture {
            runtime,
            ledger,
            manager,
            _dir: dir,
        }
    }

    #[test]
    fn targets_resolve_under_the_caller() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());
        let admin = user("root1", true, Quota::unlimited());

        assert_eq!(f.manager.resolve_target(&alice, "main").unwrap().to_string(), "alice-main");
        assert_eq!(f.manager.resolve_target(&alice, "alice-main").unwrap().to_string(), "alice-main");
        assert!(matches!(
            f.manager.resolve_target(&alice, "bob-main"),
            Err(PodyError::Forbidden { .. })
        ));
        assert_eq!(f.manager.resolve_target(&admin, "bob-main").unwrap().owner(), "bob");
        assert!(f.manager.resolve_target(&alice, "x-alice-main").is_err());
    }

    #[test]
    fn full_lifecycle() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());

        let pod = f.manager.create(&alice, "main", "base:1", &PodRequest::default()).unwrap();
        assert_eq!(pod.status, PodStatus::Created);
        assert_eq!(pod.port_mapping.len(), 1);
        assert!(pod.gpu_ids.is_empty());

        assert!(matches!(f.manager.stop(&alice, "main"), Err(PodyError::NotRunning { .. })));
        let _ = f.manager.start(&alice, "main").unwrap();
        assert!(matches!(f.manager.start(&alice, "main"), Err(PodyError::AlreadyRunning { .. })));
        f.manager.stop(&alice, "main").unwrap();
        assert_eq!(f.manager.inspect(&alice, "main").unwrap().status, PodStatus::Stopped);
        let _ = f.manager.restart(&alice, "main").unwrap();
        assert_eq!(f.manager.inspect(&alice, "main").unwrap().status, PodStatus::Running);

        assert_eq!(f.manager.list(&alice, None).unwrap(), vec!["alice-main".to_string()]);
        let _ = f.manager.delete(&alice, "main").unwrap();
        assert!(matches!(f.manager.delete(&alice, "main"), Err(PodyError::NotFound { .. })));
        assert_eq!(f.runtime.container_count(), 0);
    }

    #[test]
    fn failed_container_creation_leaves_no_trace() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());
        f.runtime.fail_next(Op::Create);
        assert!(matches!(
            f.manager.create(&alice, "main", "base:1", &PodRequest::default()),
            Err(PodyError::RuntimeFailure { .. })
        ));
        assert!(f.ledger.snapshot().pods.is_empty());
        assert!(f.manager.create(&alice, "main", "base:1", &PodRequest::default()).is_ok());
    }

    #[test]
    fn unknown_image_is_not_found() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());
        assert!(matches!(
            f.manager.create(&alice, "main", "nope:1", &PodRequest::default()),
            Err(PodyError::NotFound { kind: "image", .. })
        ));
    }

    #[test]
    fn request_above_cap_is_rejected_before_runtime() {
        let f = fixture(None);
        let quota = Quota {
            memory_limit: Limit::Limited(1024),
            ..Quota::default()
        };
        let alice = user("alice", false, quota);
        let request = PodRequest {
            memory: Some(4096),
            ..PodRequest::default()
        };
        assert!(matches!(
            f.manager.create(&alice, "main", "base:1", &request),
            Err(PodyError::QuotaExceeded { resource: QuotaResource::Memory, .. })
        ));
        assert_eq!(f.runtime.container_count(), 0);

        let pod = f.manager.create(&alice, "main", "base:1", &PodRequest::default()).unwrap();
        assert_eq!(pod.memory_limit, Limit::Limited(1024));
    }

    #[test]
    fn restart_failure_leaves_pod_stopped() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());
        let _ = f.manager.create(&alice, "main", "base:1", &PodRequest::default()).unwrap();
        let _ = f.manager.start(&alice, "main").unwrap();
        f.runtime.fail_next(Op::Start);
        assert!(matches!(
            f.manager.restart(&alice, "main"),
            Err(PodyError::RuntimeFailure { .. })
        ));
        assert_eq!(f.ledger.get("alice-main").unwrap().status, PodStatus::Stopped);
    }

    #[test]
    fn on_start_hook_output_is_appended() {
        let f = fixture(Some("echo sshd up"));
        let alice = user("alice", false, Quota::default());
        let _ = f.manager.create(&alice, "main", "base:1", &PodRequest::default()).unwrap();
        let log = f.manager.start(&alice, "main").unwrap();
        assert!(log.contains("sshd up"));
    }

    #[test]
    fn exec_runs_in_running_pods_only() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());
        let _ = f.manager.create(&alice, "main", "base:1", &PodRequest::default()).unwrap();
        assert!(matches!(
            f.manager.exec(&alice, "main", "pwd", None),
            Err(PodyError::NotRunning { .. })
        ));
        let _ = f.manager.start(&alice, "main").unwrap();
        let out = f.manager.exec(&alice, "main", "pwd", None).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.log, "/workspace\r\n");
        let err = f
            .manager
            .exec(&alice, "main", "sleep 5", Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, PodyError::Timeout { .. }));
    }

    #[test]
    fn reconcile_detects_crashed_and_missing_containers() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::unlimited());
        let a = f.manager.create(&alice, "a", "base:1", &PodRequest::default()).unwrap();
        let b = f.manager.create(&alice, "b", "base:1", &PodRequest::default()).unwrap();
        let _ = f.manager.start(&alice, "a").unwrap();
        f.runtime.crash(&a.container_id);
        f.runtime.forget(&b.container_id);

        assert_eq!(f.manager.reconcile(), 2);
        assert_eq!(f.ledger.get("alice-a").unwrap().status, PodStatus::Exited);
        assert_eq!(f.ledger.get("alice-b").unwrap().status, PodStatus::Missing);
        assert_eq!(f.manager.reconcile(), 0);

        let _ = f.manager.delete(&alice, "b").unwrap();
        assert!(f.ledger.get("alice-b").is_none());
    }

    #[test]
    fn commit_names_follow_the_caller() {
        let f = fixture(None);
        let alice = user("alice", false, Quota::default());
        let _ = f.manager.create(&alice, "main", "base:1", &PodRequest::default()).unwrap();

        let plain = f.manager.commit(&alice, "main", None, Some("snapshot")).unwrap();
        assert_eq!(plain.image_name, "alice");
        assert_eq!(plain.image, "pody-commit:alice");
        let tagged = f.manager.commit(&alice, "main", Some("v1"), None).unwrap();
        assert_eq!(tagged.image_name, "alice-v1");

        let admin = user("root1", true, Quota::unlimited());
        let out = f.manager.commit(&admin, "alice-main", Some("v2"), None);
        assert!(matches!(out, Err(PodyError::NotFound { kind: "user", .. })));
    }
}
