//! In-process container engine for tests and explicit injection.
//!
//! Containers are plain records; `exec` interprets a tiny command
//! vocabulary (`pwd`, `echo`, `exit N`, `sleep N`, `true`, `false`).
//! Individual operations can be made to fail once with
//! [`InMemoryRuntime::fail_next`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use pody_common::error::{PodyError, Result};
use pody_common::types::{ContainerId, PodStatus};
use sha2::{Digest, Sha256};

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, ImageInfo};

/// Operations that support one-shot failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `create`
    Create,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `exec`
    Exec,
    /// `commit`
    Commit,
    /// `inspect`
    Inspect,
    /// `delete`
    Delete,
    /// `list_images`
    ListImages,
    /// `delete_image`
    DeleteImage,
    /// `tag`
    Tag,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    status: PodStatus,
    pid: Option<u32>,
    log: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<ContainerId, FakeContainer>,
    images: BTreeMap<String, ImageInfo>,
    failures: HashSet<Op>,
    next_pid: u32,
    commits: u64,
}

/// Fake [`ContainerRuntime`] keeping everything in memory.
#[derive(Debug)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
    commit_size: Mutex<u64>,
    active_execs: AtomicUsize,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    /// Default size of committed images.
    pub const DEFAULT_COMMIT_SIZE: u64 = 512 * 1024 * 1024;

    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: 1000,
                ..State::default()
            }),
            commit_size: Mutex::new(Self::DEFAULT_COMMIT_SIZE),
            active_execs: AtomicUsize::new(0),
        }
    }

    /// Creates an engine that already holds the given base images.
    #[must_use]
    pub fn with_images<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let runtime = Self::new();
        for name in names {
            runtime.add_image(name, 1024 * 1024 * 1024, &[]);
        }
        runtime
    }

    /// Adds (or retags) an image.
    pub fn add_image(&self, name: &str, size: u64, exposed_ports: &[u16]) {
        let mut state = self.lock();
        let id = digest(name);
        untag(&mut state, name);
        let _ = state.images.insert(
            id.clone(),
            ImageInfo {
                id,
                tags: vec![name.to_string()],
                comment: String::new(),
                size,
                exposed_ports: exposed_ports.iter().map(|p| format!("{p}/tcp")).collect(),
                created: Utc::now(),
            },
        );
    }

    /// Makes the next call of `op` fail with `RuntimeFailure`.
    pub fn fail_next(&self, op: Op) {
        let _ = self.lock().failures.insert(op);
    }

    /// Sets the size reported for subsequently committed images.
    pub fn set_commit_size(&self, size: u64) {
        if let Ok(mut s) = self.commit_size.lock() {
            *s = size;
        }
    }

    /// Drops a container behind the manager's back.
    pub fn forget(&self, id: &ContainerId) {
        let _ = self.lock().containers.remove(id);
    }

    /// Marks a running container as exited, as if its main process died.
    pub fn crash(&self, id: &ContainerId) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.status = PodStatus::Exited;
            c.pid = None;
        }
    }

    /// Number of containers the engine knows.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Number of `exec` commands currently executing.
    pub fn active_execs(&self) -> usize {
        self.active_execs.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is only mutated in small, panic-free sections.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_failure(&self, op: Op) -> Result<()> {
        if self.lock().failures.remove(&op) {
            return Err(PodyError::runtime(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

fn digest(seed: &str) -> String {
    let hash = Sha256::digest(seed.as_bytes());
    let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

fn not_found(id: &ContainerId) -> PodyError {
    PodyError::NotFound {
        kind: "container",
        id: id.to_string(),
    }
}

/// Removes `name` from whatever image currently carries it.
fn untag(state: &mut State, name: &str) {
    state.images.retain(|_, image| {
        image.tags.retain(|t| t != name);
        !image.tags.is_empty()
    });
}

fn find_container<'a>(state: &'a mut State, id: &ContainerId) -> Result<&'a mut FakeContainer> {
    state.containers.get_mut(id).ok_or_else(|| not_found(id))
}

/// Interprets the fake shell vocabulary. Returns `(exit_code, output,
/// seconds to sleep)`.
fn interpret(command: &str) -> (i32, String, Option<f64>) {
    let command = command.trim();
    let (word, rest) = command.split_once(' ').unwrap_or((command, ""));
    match word {
        "pwd" => (0, "/workspace\r\n".into(), None),
        "echo" => (0, format!("{rest}\r\n"), None),
        "true" | "" => (0, String::new(), None),
        "false" => (1, String::new(), None),
        "exit" if rest.trim().is_empty() => (0, String::new(), None),
        "exit" => (rest.trim().parse().unwrap_or(2), String::new(), None),
        "sleep" => match rest.trim().parse::<f64>() {
            Ok(secs) if secs >= 0.0 => (0, String::new(), Some(secs)),
            _ => (1, "sleep: invalid time interval\r\n".into(), None),
        },
        other => (127, format!("bash: {other}: command not found\r\n"), None),
    }
}

struct ExecGuard<'a>(&'a AtomicUsize);

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.check_failure(Op::Create)?;
        let mut state = self.lock();
        if !state.images.values().any(|i| i.tags.contains(&spec.image)) {
            return Err(PodyError::NotFound {
                kind: "image",
                id: spec.image.clone(),
            });
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(PodyError::runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let id = ContainerId::generate();
        let _ = state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: PodStatus::Created,
                pid: None,
                log: Vec::new(),
            },
        );
        tracing::debug!(name = %spec.name, id = %id, "fake container created");
        Ok(id)
    }

    fn start(&self, id: &ContainerId) -> Result<String> {
        self.check_failure(Op::Start)?;
        let mut state = self.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        let container = find_container(&mut state, id)?;
        if container.status != PodStatus::Running {
            container.status = PodStatus::Running;
            container.pid = Some(pid);
            container.log.push(format!("{} started", container.spec.name));
        }
        let skip = container
            .log
            .len()
            .saturating_sub(pody_common::constants::START_LOG_TAIL);
        Ok(container.log[skip..]
            .iter()
            .map(|l| format!("{l}\n"))
            .collect())
    }

    fn stop(&self, id: &ContainerId) -> Result<()> {
        self.check_failure(Op::Stop)?;
        let mut state = self.lock();
        let container = find_container(&mut state, id)?;
        if container.status == PodStatus::Running {
            container.status = PodStatus::Exited;
            container.pid = None;
            container.log.push(format!("{} stopped", container.spec.name));
        }
        Ok(())
    }

    fn exec(&self, id: &ContainerId, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.check_failure(Op::Exec)?;
        {
            let mut state = self.lock();
            let container = find_container(&mut state, id)?;
            if container.status != PodStatus::Running {
                return Err(PodyError::runtime(format!(
                    "container {id} is not running"
                )));
            }
        }

        let _ = self.active_execs.fetch_add(1, Ordering::SeqCst);
        let _guard = ExecGuard(&self.active_execs);

        let (exit_code, output, sleep) = interpret(command);
        if let Some(secs) = sleep {
            let wanted = Duration::from_secs_f64(secs);
            if wanted > timeout {
                std::thread::sleep(timeout);
                return Ok(ExecOutput {
                    exit_code: 124,
                    output,
                    truncated: true,
                });
            }
            std::thread::sleep(wanted);
        }
        Ok(ExecOutput {
            exit_code,
            output,
            truncated: false,
        })
    }

    fn commit(&self, id: &ContainerId, image: &str, message: Option<&str>) -> Result<ImageInfo> {
        self.check_failure(Op::Commit)?;
        let size = self.commit_size.lock().map_or(Self::DEFAULT_COMMIT_SIZE, |s| *s);
        let mut state = self.lock();
        let exposed_ports: BTreeSet<String> = find_container(&mut state, id)?
            .spec
            .port_mapping
            .iter()
            .map(|m| format!("{}/tcp", m.container_port))
            .collect();
        state.commits += 1;
        let info = ImageInfo {
            id: digest(&format!("{id}/{image}/{}", state.commits)),
            tags: vec![image.to_string()],
            comment: message.unwrap_or_default().to_string(),
            size,
            exposed_ports,
            created: Utc::now(),
        };
        untag(&mut state, image);
        let _ = state.images.insert(info.id.clone(), info.clone());
        Ok(info)
    }

    fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus> {
        self.check_failure(Op::Inspect)?;
        let mut state = self.lock();
        let c = find_container(&mut state, id)?;
        Ok(ContainerStatus {
            id: id.clone(),
            name: c.spec.name.clone(),
            status: c.status,
            image: c.spec.image.clone(),
            pid: c.pid,
            port_mapping: c.spec.port_mapping.clone(),
            gpu_ids: c.spec.gpu_ids.clone(),
            memory_limit: c.spec.memory_limit,
            shm_size: c.spec.shm_size,
        })
    }

    fn delete(&self, id: &ContainerId) -> Result<()> {
        self.check_failure(Op::Delete)?;
        self.lock()
            .containers
            .remove(id)
            .map(drop)
            .ok_or_else(|| not_found(id))
    }

    fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.check_failure(Op::ListImages)?;
        Ok(self.lock().images.values().cloned().collect())
    }

    fn delete_image(&self, name: &str) -> Result<()> {
        self.check_failure(Op::DeleteImage)?;
        let mut state = self.lock();
        let known = state
            .images
            .values()
            .any(|i| i.id == name || i.tags.iter().any(|t| t == name));
        if !known {
            return Err(PodyError::NotFound {
                kind: "image",
                id: name.to_string(),
            });
        }
        if state.images.remove(name).is_none() {
            untag(&mut state, name);
        }
        Ok(())
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.check_failure(Op::Tag)?;
        let mut state = self.lock();
        let image = state
            .images
            .values()
            .find(|i| i.id == source || i.tags.iter().any(|t| t == source))
            .ok_or_else(|| PodyError::NotFound {
                kind: "image",
                id: source.to_string(),
            })?;
        if image.tags.iter().any(|t| t == target) {
            return Ok(());
        }
        let id = image.id.clone();
        untag(&mut state, target);
        if let Some(image) = state.images.get_mut(&id) {
            image.tags.push(target.to_string());
        }
        Ok(())
    }

    fn version(&self) -> Result<String> {
        Ok(format!("memory-{}", env!("CARGO_PKG_VERSION")))
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "base:1".into(),
            owner: "alice".into(),
            gpu_ids: vec![],
            port_mapping: vec![pody_common::types::PortMapping {
                host_port: 20000,
                container_port: 22,
            }],
            memory_limit: None,
            shm_size: None,
            storage_size: None,
            volumes: vec![],
        }
    }

    #[test]
    fn lifecycle_round() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let id = rt.create(&spec("alice-main")).unwrap();
        assert_eq!(rt.inspect(&id).unwrap().status, PodStatus::Created);

        let log = rt.start(&id).unwrap();
        assert!(log.contains("alice-main started"));
        assert!(rt.inspect(&id).unwrap().pid.is_some());

        rt.stop(&id).unwrap();
        assert_eq!(rt.inspect(&id).unwrap().status, PodStatus::Exited);

        rt.delete(&id).unwrap();
        assert!(matches!(rt.inspect(&id), Err(PodyError::NotFound { .. })));
    }

    #[test]
    fn create_requires_known_image_and_unique_name() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let mut bad = spec("alice-x");
        bad.image = "nope".into();
        assert!(matches!(rt.create(&bad), Err(PodyError::NotFound { kind: "image", .. })));

        let _ = rt.create(&spec("alice-main")).unwrap();
        assert!(rt.create(&spec("alice-main")).is_err());
    }

    #[test]
    fn exec_vocabulary() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let id = rt.create(&spec("alice-main")).unwrap();
        let _ = rt.start(&id).unwrap();
        let t = Duration::from_secs(1);

        let out = rt.exec(&id, "pwd", t).unwrap();
        assert_eq!((out.exit_code, out.output.as_str()), (0, "/workspace\r\n"));
        assert_eq!(rt.exec(&id, "exit 7", t).unwrap().exit_code, 7);
        assert_eq!(rt.exec(&id, "nvcc", t).unwrap().exit_code, 127);

        let slow = rt.exec(&id, "sleep 5", Duration::from_millis(20)).unwrap();
        assert!(slow.truncated);
        assert_eq!(rt.active_execs(), 0);
    }

    #[test]
    fn exec_on_stopped_container_fails() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let id = rt.create(&spec("alice-main")).unwrap();
        assert!(rt.exec(&id, "pwd", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn injected_failure_fires_once() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let id = rt.create(&spec("alice-main")).unwrap();
        rt.fail_next(Op::Start);
        assert!(matches!(rt.start(&id), Err(PodyError::RuntimeFailure { .. })));
        assert!(rt.start(&id).is_ok());
    }

    #[test]
    fn commit_retags_and_delete_image_removes_tag() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let id = rt.create(&spec("alice-main")).unwrap();
        rt.set_commit_size(42);

        let first = rt.commit(&id, "pody-commit:alice", Some("v1")).unwrap();
        assert_eq!(first.size, 42);
        assert!(first.exposed_ports.contains("22/tcp"));
        let second = rt.commit(&id, "pody-commit:alice", None).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(rt.list_images().unwrap().len(), 2);

        rt.delete_image("pody-commit:alice").unwrap();
        assert_eq!(rt.list_images().unwrap().len(), 1);
        assert!(rt.delete_image("pody-commit:alice").is_err());
    }

    #[test]
    fn tag_moves_a_reference_between_images() {
        let rt = InMemoryRuntime::with_images(["base:1"]);
        let id = rt.create(&spec("alice-main")).unwrap();
        let old = rt.commit(&id, "pody-commit:alice", None).unwrap();
        let new = rt.commit(&id, "staging:alice-1", None).unwrap();

        rt.tag("staging:alice-1", "pody-commit:alice").unwrap();
        let images = rt.list_images().unwrap();
        assert!(images.iter().all(|i| i.id != old.id));
        let moved = images.iter().find(|i| i.id == new.id).unwrap();
        assert_eq!(moved.tags, vec!["staging:alice-1", "pody-commit:alice"]);

        rt.delete_image("staging:alice-1").unwrap();
        let images = rt.list_images().unwrap();
        assert_eq!(images.iter().find(|i| i.id == new.id).unwrap().tags, vec!["pody-commit:alice"]);
        assert!(matches!(
            rt.tag("nope:1", "pody-commit:alice"),
            Err(PodyError::NotFound { kind: "image", .. })
        ));
    }
}
