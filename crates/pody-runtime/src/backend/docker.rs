//! Container engine backed by the `docker` command-line client.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pody_common::constants::{OWNER_LABEL, START_LOG_TAIL};
use pody_common::error::{PodyError, Result};
use pody_common::types::{ContainerId, PodStatus, PortMapping};
use serde_json::Value;

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, ImageInfo};
use crate::exec;

/// Working directory of every pod.
pub const WORKDIR: &str = "/workspace";

/// Exit codes `timeout(1)` returns after stopping the command: 124 for
/// SIGTERM, 137 when `--kill-after` had to follow up with SIGKILL.
const TIMEOUT_EXIT_CODES: [i32; 2] = [124, 137];

/// Extra time the host side waits beyond the in-container deadline.
const EXEC_SLACK: Duration = Duration::from_secs(5);

/// Drives a local Docker engine through its CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    grace: Duration,
}

impl DockerCli {
    /// Uses the given `docker` binary.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            grace,
        }
    }

    /// Locates `docker` in `PATH`.
    #[must_use]
    pub fn detect(grace: Duration) -> Option<Self> {
        which::which("docker").ok().map(|b| Self::new(b, grace))
    }

    /// Locates `docker` in a `PATH`-style list of directories.
    #[must_use]
    pub fn detect_in(search_path: &OsStr, grace: Duration) -> Option<Self> {
        let cwd = std::env::current_dir().ok()?;
        which::which_in("docker", Some(search_path), cwd)
            .ok()
            .map(|b| Self::new(b, grace))
    }

    /// Path of the client binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs a docker subcommand and returns its trimmed stdout.
    fn run<I, S>(&self, target: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let subcommand = args
            .first()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::debug!(subcommand = %subcommand, target, "invoking docker");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|e| PodyError::Io {
                path: self.binary.clone(),
                source: e,
            })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(classify_failure(
            &subcommand,
            target,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    fn inspect_images(&self, refs: &[String]) -> Result<Vec<ImageInfo>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["image".to_string(), "inspect".to_string()];
        args.extend(refs.iter().cloned());
        let raw = self.run(&refs.join(" "), &args)?;
        let docs: Vec<Value> = serde_json::from_str(&raw)?;
        docs.iter().map(parse_image).collect()
    }
}

impl ContainerRuntime for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let args = create_args(spec);
        let id = self.run(&spec.name, &args)?;
        tracing::info!(name = %spec.name, id = %id, "container created");
        Ok(ContainerId::new(id))
    }

    fn start(&self, id: &ContainerId) -> Result<String> {
        let _ = self.run(id.as_str(), ["start", id.as_str()])?;
        let tail = START_LOG_TAIL.to_string();
        let output = Command::new(&self.binary)
            .args(["logs", "--tail", &tail, id.as_str()])
            .output()
            .map_err(|e| PodyError::Io {
                path: self.binary.clone(),
                source: e,
            })?;
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(log)
    }

    fn stop(&self, id: &ContainerId) -> Result<()> {
        self.run(id.as_str(), ["stop", id.as_str()]).map(drop)
    }

    fn exec(&self, id: &ContainerId, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.binary);
        let _ = cmd.args(exec_args(id, command, timeout, self.grace));
        let supervised = exec::run_with_deadline(cmd, timeout + self.grace + EXEC_SLACK, self.grace)?;
        if !supervised.timed_out && is_missing(&supervised.stderr) {
            return Err(PodyError::NotFound {
                kind: "container",
                id: id.to_string(),
            });
        }
        let stopped_in_container =
            stopped_by_timeout(supervised.exit_code, supervised.elapsed, in_container_limit(timeout));
        Ok(ExecOutput {
            exit_code: supervised.exit_code,
            truncated: supervised.timed_out || stopped_in_container,
            output: supervised.combined(),
        })
    }

    fn commit(&self, id: &ContainerId, image: &str, message: Option<&str>) -> Result<ImageInfo> {
        let mut args = vec!["commit".to_string()];
        if let Some(m) = message {
            args.push("--message".into());
            args.push(m.into());
        }
        args.push(id.to_string());
        args.push(image.to_string());
        let image_id = self.run(id.as_str(), &args)?;
        tracing::info!(id = %id, image, image_id = %image_id, "container committed");
        self.inspect_images(&[image.to_string()])?
            .pop()
            .ok_or_else(|| PodyError::NotFound {
                kind: "image",
                id: image.to_string(),
            })
    }

    fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let raw = self.run(
            id.as_str(),
            ["inspect", "--type", "container", "--format", "{{json .}}", id.as_str()],
        )?;
        let doc: Value = serde_json::from_str(&raw)?;
        parse_container(&doc)
    }

    fn delete(&self, id: &ContainerId) -> Result<()> {
        self.run(id.as_str(), ["rm", "--force", id.as_str()]).map(drop)
    }

    fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let raw = self.run("images", ["image", "ls", "--quiet", "--no-trunc"])?;
        let ids: BTreeSet<String> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        self.inspect_images(&ids.into_iter().collect::<Vec<_>>())
    }

    fn delete_image(&self, name: &str) -> Result<()> {
        self.run(name, ["image", "rm", name]).map(drop)
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run(source, ["tag", source, target]).map(drop)
    }

    fn version(&self) -> Result<String> {
        self.run("server", ["version", "--format", "{{.Server.Version}}"])
    }

    fn is_available(&self) -> bool {
        self.version().is_ok()
    }
}

/// Arguments for `docker create`.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--interactive".into(),
        "--tty".into(),
        "--name".into(),
        spec.name.clone(),
        "--hostname".into(),
        spec.name.clone(),
        "--label".into(),
        format!("{OWNER_LABEL}={}", spec.owner),
        "--workdir".into(),
        WORKDIR.into(),
    ];
    if !spec.gpu_ids.is_empty() {
        let ids: Vec<String> = spec.gpu_ids.iter().map(u32::to_string).collect();
        args.push("--gpus".into());
        args.push(format!("\"device={}\"", ids.join(",")));
    }
    for mapping in &spec.port_mapping {
        args.push("--publish".into());
        args.push(mapping.to_string());
    }
    if let Some(memory) = spec.memory_limit {
        args.push("--memory".into());
        args.push(memory.to_string());
    }
    if let Some(shm) = spec.shm_size {
        args.push("--shm-size".into());
        args.push(shm.to_string());
    }
    if let Some(storage) = spec.storage_size {
        args.push("--storage-opt".into());
        args.push(format!("size={storage}"));
    }
    for volume in &spec.volumes {
        args.push("--volume".into());
        args.push(volume.clone());
    }
    args.push(spec.image.clone());
    args
}

/// Arguments for `docker exec`, with the deadline enforced in the
/// container by `timeout(1)` as well.
fn exec_args(id: &ContainerId, command: &str, timeout: Duration, grace: Duration) -> Vec<String> {
    vec![
        "exec".into(),
        "--tty".into(),
        "--user".into(),
        "root".into(),
        id.to_string(),
        "timeout".into(),
        format!("--kill-after={}s", grace.as_secs().max(1)),
        format!("{}s", in_container_limit(timeout).as_secs()),
        "/bin/bash".into(),
        "-c".into(),
        command.into(),
    ]
}

/// Deadline `timeout(1)` enforces inside the container.
fn in_container_limit(timeout: Duration) -> Duration {
    Duration::from_secs(timeout.as_secs().max(1))
}

/// A timeout exit code only counts once the deadline has actually passed;
/// a command may exit 124 on its own.
fn stopped_by_timeout(exit_code: i32, elapsed: Duration, limit: Duration) -> bool {
    TIMEOUT_EXIT_CODES.contains(&exit_code) && elapsed >= limit
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container")
}

fn classify_failure(subcommand: &str, target: &str, stderr: &str) -> PodyError {
    if is_missing(stderr) {
        return PodyError::NotFound {
            kind: "container",
            id: target.to_string(),
        };
    }
    if stderr.contains("No such image") {
        return PodyError::NotFound {
            kind: "image",
            id: target.to_string(),
        };
    }
    PodyError::runtime(format!("docker {subcommand} {target}: {}", stderr.trim()))
}

fn parse_container(doc: &Value) -> Result<ContainerStatus> {
    let id = doc["Id"]
        .as_str()
        .ok_or_else(|| PodyError::runtime("docker inspect returned no container id"))?;
    let state = &doc["State"];
    let host = &doc["HostConfig"];

    let pid = state["Pid"]
        .as_u64()
        .filter(|p| *p > 0)
        .and_then(|p| u32::try_from(p).ok());

    let mut port_mapping = Vec::new();
    if let Some(bindings) = host["PortBindings"].as_object() {
        for (container, hosts) in bindings {
            let Some(container_port) = container.split('/').next().and_then(|p| p.parse().ok()) else {
                continue;
            };
            for binding in hosts.as_array().into_iter().flatten() {
                if let Some(host_port) = binding["HostPort"].as_str().and_then(|p| p.parse().ok()) {
                    port_mapping.push(PortMapping {
                        host_port,
                        container_port,
                    });
                }
            }
        }
    }
    port_mapping.sort_unstable();

    let gpu_ids = host["DeviceRequests"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|req| req["DeviceIDs"].as_array().into_iter().flatten())
        .filter_map(|d| d.as_str().and_then(|s| s.parse().ok()))
        .collect();

    Ok(ContainerStatus {
        id: ContainerId::new(id),
        name: doc["Name"].as_str().unwrap_or_default().trim_start_matches('/').to_string(),
        status: PodStatus::from_runtime(state["Status"].as_str().unwrap_or_default()),
        image: doc["Config"]["Image"].as_str().unwrap_or_default().to_string(),
        pid,
        port_mapping,
        gpu_ids,
        memory_limit: host["Memory"].as_u64().filter(|m| *m > 0),
        shm_size: host["ShmSize"].as_u64().filter(|s| *s > 0),
    })
}

fn parse_image(doc: &Value) -> Result<ImageInfo> {
    let id = doc["Id"]
        .as_str()
        .ok_or_else(|| PodyError::runtime("docker image inspect returned no image id"))?;
    let tags = doc["RepoTags"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| t.as_str().map(str::to_string))
        .collect();
    let exposed_ports = doc["Config"]["ExposedPorts"]
        .as_object()
        .map(|ports| ports.keys().cloned().collect())
        .unwrap_or_default();
    let created = doc["Created"]
        .as_str()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_default();
    Ok(ImageInfo {
        id: id.to_string(),
        tags,
        comment: doc["Comment"].as_str().unwrap_or_default().to_string(),
        size: doc["Size"].as_u64().unwrap_or_default(),
        exposed_ports,
        created,
    })
}
