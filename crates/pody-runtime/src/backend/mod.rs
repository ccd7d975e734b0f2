//! Container engine abstraction.
//!
//! The lifecycle manager never talks to an engine directly; every call goes
//! through [`ContainerRuntime`] and returns a [`Result`], so failure paths
//! can be exercised against [`memory::InMemoryRuntime`]. The in-memory
//! engine is only ever injected explicitly; host detection never falls
//! back to it.

pub mod docker;
pub mod memory;

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pody_common::error::{PodyError, Result};
use pody_common::types::{ContainerId, PodStatus, PortMapping};
use serde::{Deserialize, Serialize};

/// Configuration for creating a pod container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Full pod name, used as the container name.
    pub name: String,
    /// Image to create the container from.
    pub image: String,
    /// Owning username, attached as a label.
    pub owner: String,
    /// GPU devices assigned exclusively to this pod.
    pub gpu_ids: Vec<u32>,
    /// Host to container port bindings.
    pub port_mapping: Vec<PortMapping>,
    /// Memory limit in bytes (`None` = unlimited).
    pub memory_limit: Option<u64>,
    /// Shared-memory size in bytes (`None` = engine default).
    pub shm_size: Option<u64>,
    /// Writable layer size in bytes (`None` = unlimited).
    pub storage_size: Option<u64>,
    /// Volume bindings (`host:container[:mode]`).
    pub volumes: Vec<String>,
}

/// Point-in-time view of a container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Engine identifier.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Lifecycle status.
    pub status: PodStatus,
    /// Image the container runs.
    pub image: String,
    /// PID of the main process, if running.
    pub pid: Option<u32>,
    /// Published ports.
    pub port_mapping: Vec<PortMapping>,
    /// Assigned GPU devices.
    pub gpu_ids: Vec<u32>,
    /// Memory limit in bytes, if any.
    pub memory_limit: Option<u64>,
    /// Shared-memory size in bytes, if reported.
    pub shm_size: Option<u64>,
}

/// Output from a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code returned by the command.
    pub exit_code: i32,
    /// Combined terminal output.
    pub output: String,
    /// Set when the command was killed at its deadline; `output` is partial.
    pub truncated: bool,
}

/// An image known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Content hash (`sha256:...`).
    pub id: String,
    /// Repository tags pointing at this image.
    pub tags: Vec<String>,
    /// Commit comment.
    pub comment: String,
    /// Size in bytes.
    pub size: u64,
    /// Exposed port specs (`22/tcp`).
    pub exposed_ports: BTreeSet<String>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

/// Platform-agnostic container engine.
///
/// Implementors handle the engine-specific details of container creation,
/// execution, and teardown. None of the calls retry on failure.
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Creates a container without starting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created.
    fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Starts a container and returns the tail of its log.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    fn start(&self, id: &ContainerId) -> Result<String>;

    /// Stops a running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    fn stop(&self, id: &ContainerId) -> Result<()>;

    /// Runs `/bin/bash -c command` as root inside the container, killing it
    /// once `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be launched at all. A command
    /// that ran past its deadline is reported through
    /// [`ExecOutput::truncated`], not as an error.
    fn exec(&self, id: &ContainerId, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Commits the container filesystem to a new image named `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit(&self, id: &ContainerId, image: &str, message: Option<&str>) -> Result<ImageInfo>;

    /// Reports the container's current status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the engine does not know the container.
    fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus>;

    /// Removes a container, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be removed.
    fn delete(&self, id: &ContainerId) -> Result<()>;

    /// Lists every image in the engine's store.
    ///
    /// # Errors
    ///
    /// Returns an error if the image store cannot be queried.
    fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Removes an image tag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown images.
    fn delete_image(&self, name: &str) -> Result<()>;

    /// Points `target` at the image `source` names. Whatever image
    /// `target` named before loses that tag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `source` is unknown.
    fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Engine version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    fn version(&self) -> Result<String>;

    /// Whether this backend is operational on the current host.
    fn is_available(&self) -> bool;
}

/// Picks the engine for this host: the `docker` CLI found in `PATH`.
///
/// # Errors
///
/// Returns `RuntimeFailure` when no `docker` binary is installed.
pub fn detect_runtime(grace: Duration) -> Result<Arc<dyn ContainerRuntime>> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    runtime_in(&search_path, grace)
}

fn runtime_in(search_path: &OsStr, grace: Duration) -> Result<Arc<dyn ContainerRuntime>> {
    let cli = docker::DockerCli::detect_in(search_path, grace)
        .ok_or_else(|| PodyError::runtime("docker not found in PATH, install the docker CLI to manage pods"))?;
    tracing::info!(binary = %cli.binary().display(), "using docker runtime");
    Ok(Arc::new(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_spec_can_be_constructed() {
        let spec = ContainerSpec {
            name: "alice-main".into(),
            image: "ubuntu:22.04".into(),
            owner: "alice".into(),
            gpu_ids: vec![0, 1],
            port_mapping: vec![PortMapping {
                host_port: 20000,
                container_port: 22,
            }],
            memory_limit: Some(8 << 30),
            shm_size: None,
            storage_size: None,
            volumes: vec![],
        };
        assert_eq!(spec.gpu_ids.len(), 2);
        assert_eq!(spec.port_mapping[0].to_string(), "20000:22");
    }

    #[test]
    fn missing_docker_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = runtime_in(dir.path().as_os_str(), Duration::from_secs(1))
            .err()
            .expect("expected an error");
        assert!(matches!(err, PodyError::RuntimeFailure { .. }));
    }

    #[test]
    fn docker_on_the_search_path_is_used() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let binary = dir.path().join("docker");
        std::fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = runtime_in(dir.path().as_os_str(), Duration::from_secs(1)).unwrap();
        assert_eq!(runtime.name(), "docker");
    }
}
