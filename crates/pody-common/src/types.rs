//! Domain primitive types used across the Pody workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PodyError, Result};

/// Opaque identifier the container runtime assigns to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `other` names this container, allowing short-id prefixes.
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        !other.is_empty() && (self.0.starts_with(other) || other.starts_with(&self.0))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    /// Created but never started.
    Created,
    /// Actively running.
    Running,
    /// Stopped through the manager.
    Stopped,
    /// The main process exited on its own.
    Exited,
    /// The runtime no longer knows the container.
    Missing,
}

impl PodStatus {
    /// Whether the pod counts as running.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Maps a runtime status string (`docker inspect` vocabulary).
    #[must_use]
    pub fn from_runtime(status: &str) -> Self {
        match status {
            "running" | "restarting" | "paused" => Self::Running,
            "created" => Self::Created,
            "exited" | "dead" => Self::Exited,
            "removing" => Self::Missing,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// A host-port to container-port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

/// Validates a username: 3 to 20 ASCII alphanumeric characters.
///
/// # Errors
///
/// Returns `InvalidInput` describing the first violated rule.
pub fn validate_username(name: &str) -> Result<()> {
    if !(3..=20).contains(&name.len()) {
        return Err(PodyError::invalid(
            "username must be between 3 and 20 characters",
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(PodyError::invalid("username must be alphanumeric"));
    }
    Ok(())
}

/// Validates an instance tag: 1 to 32 characters of `[A-Za-z0-9_.]`.
///
/// # Errors
///
/// Returns `InvalidInput` if the tag is empty, too long, or contains a
/// separator character.
pub fn validate_instance(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > 32 {
        return Err(PodyError::invalid(
            "instance tag must be between 1 and 32 characters",
        ));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(PodyError::invalid(format!(
            "invalid instance tag {tag:?}: only letters, digits, '_' and '.' are allowed"
        )));
    }
    Ok(())
}

/// Tenant-scoped pod name: `[<prefix>-]<owner>-<instance>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodName {
    prefix: Option<String>,
    owner: String,
    instance: String,
}

impl PodName {
    /// Builds a validated pod name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the owner or instance is malformed.
    pub fn new(prefix: Option<&str>, owner: &str, instance: &str) -> Result<Self> {
        validate_username(owner)?;
        validate_instance(instance)?;
        Ok(Self {
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
            owner: owner.to_string(),
            instance: instance.to_string(),
        })
    }

    /// Owning username.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Instance tag.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Name prefix, if configured.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

impl fmt::Display for PodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(p) => write!(f, "{p}-{}-{}", self.owner, self.instance),
            None => write!(f, "{}-{}", self.owner, self.instance),
        }
    }
}

/// A caller-supplied pod reference before ownership checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef<'a> {
    /// Explicit prefix component, if the reference carried one.
    pub prefix: Option<&'a str>,
    /// Explicit owner component, if the reference carried one.
    pub owner: Option<&'a str>,
    /// Instance tag.
    pub instance: &'a str,
}

impl<'a> PodRef<'a> {
    /// Splits `instance`, `user-instance`, or `prefix-user-instance`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for references with more than three parts
    /// or empty components.
    pub fn parse(reference: &'a str) -> Result<Self> {
        let parts: Vec<&str> = reference.split('-').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PodyError::invalid(format!("invalid pod name: {reference}")));
        }
        match parts[..] {
            [instance] => Ok(Self {
                prefix: None,
                owner: None,
                instance,
            }),
            [owner, instance] => Ok(Self {
                prefix: None,
                owner: Some(owner),
                instance,
            }),
            [prefix, owner, instance] => Ok(Self {
                prefix: Some(prefix),
                owner: Some(owner),
                instance,
            }),
            _ => Err(PodyError::invalid(format!("invalid pod name: {reference}"))),
        }
    }
}

/// Semantic version of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
