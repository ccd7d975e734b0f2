//! Global configuration model for the Pody service.
//!
//! Loaded from `<data_dir>/config.yaml`; a default file is written on
//! first use so operators have something to edit.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{PodyError, Result};
use crate::quota::Quota;

/// A base image that users may create pods from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image name, with or without a tag (`ubuntu2204-cuda121:latest`).
    /// A name without a tag admits every tag of that repository.
    pub name: String,
    /// Container ports that get a host port on create.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Free-form description shown in listings.
    #[serde(default)]
    pub description: String,
}

impl ImageConfig {
    /// Whether this entry admits the concrete image `name`.
    #[must_use]
    pub fn admits(&self, name: &str) -> bool {
        self.name == name
            || (!self.name.contains(':')
                && name
                    .strip_prefix(self.name.as_str())
                    .is_some_and(|rest| rest.starts_with(':')))
    }
}

/// Which images a user may create pods from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSourcePolicy {
    /// Configured base images and the owner's own committed images.
    #[default]
    OwnerOnly,
    /// Configured base images and any user's committed images.
    AnyCommitted,
}

/// Root configuration for the Pody service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodyConfig {
    /// Base directory for state and data.
    pub data_dir: PathBuf,
    /// Optional prefix for pod names (`<prefix>-<user>-<instance>`).
    pub name_prefix: Option<String>,
    /// Repository used for committed images.
    pub commit_name: String,
    /// Base images users may create pods from.
    pub images: Vec<ImageConfig>,
    /// Container ports exposed for pods created from committed images.
    pub commit_image_ports: Vec<u16>,
    /// Host port pool, e.g. `"20000-20999,8080"`.
    pub available_ports: String,
    /// Volume bindings applied to every pod (`host:container[:mode]`).
    pub volume_mappings: Vec<String>,
    /// GPU device pool; `None` asks the device driver.
    pub gpu_ids: Option<Vec<u32>>,
    /// Default `exec` timeout in seconds.
    pub default_exec_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for timed-out commands.
    pub exec_grace_secs: u64,
    /// Image source resolution policy for `create`.
    pub image_source_policy: ImageSourcePolicy,
    /// Command executed inside a pod after it starts.
    pub on_start: Option<String>,
    /// Interval between usage samples in seconds.
    pub sample_interval_secs: u64,
    /// Quota assigned to newly provisioned users.
    pub default_quota: Quota,
}

impl Default for PodyConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            name_prefix: None,
            commit_name: constants::DEFAULT_COMMIT_NAME.to_string(),
            images: vec![ImageConfig {
                name: "ubuntu2204-cuda121:latest".into(),
                ports: vec![22],
                description: "Ubuntu 22.04 with CUDA 12.1".into(),
            }],
            commit_image_ports: vec![22],
            available_ports: "20000-20999".into(),
            volume_mappings: Vec::new(),
            gpu_ids: None,
            default_exec_timeout_secs: constants::DEFAULT_EXEC_TIMEOUT_SECS,
            exec_grace_secs: constants::DEFAULT_EXEC_GRACE_SECS,
            image_source_policy: ImageSourcePolicy::default(),
            on_start: None,
            sample_interval_secs: constants::DEFAULT_SAMPLE_INTERVAL_SECS,
            default_quota: Quota::default(),
        }
    }
}

impl PodyConfig {
    /// Loads the configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PodyError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| PodyError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Loads `<data_dir>/config.yaml`, writing the default file first if
    /// it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created, read,
    /// or parsed.
    pub fn load_or_init(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(constants::CONFIG_FILE);
        if !path.exists() {
            std::fs::create_dir_all(data_dir).map_err(|e| PodyError::Io {
                path: data_dir.to_path_buf(),
                source: e,
            })?;
            let default = Self {
                data_dir: data_dir.to_path_buf(),
                ..Self::default()
            };
            let yaml = serde_yaml::to_string(&default).map_err(|e| PodyError::Config {
                message: e.to_string(),
            })?;
            std::fs::write(&path, yaml).map_err(|e| PodyError::Io {
                path: path.clone(),
                source: e,
            })?;
            tracing::info!(path = %path.display(), "default configuration written");
        }
        Self::load(&path)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the port pool, commit name, or prefix is invalid.
    pub fn validate(&self) -> Result<()> {
        let _ = self.port_pool()?;
        if self.commit_name.is_empty() || self.commit_name.contains(':') {
            return Err(PodyError::Config {
                message: format!("invalid commit_name {:?}", self.commit_name),
            });
        }
        if let Some(prefix) = self
            .name_prefix
            .as_deref()
            .filter(|p| p.contains('-') || p.contains(':'))
        {
            return Err(PodyError::Config {
                message: format!("name_prefix {prefix:?} must not contain '-' or ':'"),
            });
        }
        if self.default_exec_timeout_secs == 0 {
            return Err(PodyError::Config {
                message: "default_exec_timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }

    /// Expands `available_ports` into a sorted, de-duplicated list.
    ///
    /// # Errors
    ///
    /// Returns `Config` for malformed entries or inverted ranges.
    pub fn port_pool(&self) -> Result<Vec<u16>> {
        parse_port_pool(&self.available_ports)
    }

    /// Path of a file inside the data directory.
    #[must_use]
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

/// Parses a port pool such as `"20000-20010, 8080"`.
///
/// # Errors
///
/// Returns `Config` for malformed entries or inverted ranges.
pub fn parse_port_pool(spec: &str) -> Result<Vec<u16>> {
    let bad = |entry: &str| PodyError::Config {
        message: format!("invalid port entry {entry:?} in available_ports"),
    };
    let mut ports = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if let Some((start, end)) = entry.split_once('-') {
            let start: u16 = start.trim().parse().map_err(|_| bad(entry))?;
            let end: u16 = end.trim().parse().map_err(|_| bad(entry))?;
            if start >= end {
                return Err(bad(entry));
            }
            ports.extend(start..=end);
        } else {
            ports.push(entry.parse().map_err(|_| bad(entry))?);
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_pool_expands_ranges() {
        let pool = parse_port_pool("20000-20002, 8080").unwrap();
        assert_eq!(pool, vec![8080, 20000, 20001, 20002]);
    }

    #[test]
    fn port_pool_rejects_inverted_range() {
        assert!(parse_port_pool("30-20").is_err());
        assert!(parse_port_pool("abc").is_err());
        assert!(parse_port_pool("70000").is_err());
    }

    #[test]
    fn untagged_image_config_admits_every_tag() {
        let c = ImageConfig {
            name: "ubuntu".into(),
            ports: vec![],
            description: String::new(),
        };
        assert!(c.admits("ubuntu:22.04"));
        assert!(c.admits("ubuntu"));
        assert!(!c.admits("ubuntu-custom:1"));

        let tagged = ImageConfig {
            name: "ubuntu:22.04".into(),
            ports: vec![],
            description: String::new(),
        };
        assert!(!tagged.admits("ubuntu:24.04"));
    }

    #[test]
    fn load_or_init_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PodyConfig::load_or_init(dir.path()).unwrap();
        assert!(dir.path().join(constants::CONFIG_FILE).exists());
        assert_eq!(config.commit_name, "pody-commit");
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn load_reads_partial_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "name_prefix: lab\navailable_ports: \"21000-21010\"\ndefault_quota:\n  max_pods: 3\n  gpu_count: 2\n",
        )
        .unwrap();
        let config = PodyConfig::load(&path).unwrap();
        assert_eq!(config.name_prefix.as_deref(), Some("lab"));
        assert_eq!(config.port_pool().unwrap().len(), 11);
        assert_eq!(config.default_quota.max_pods.value(), Some(3));
        assert_eq!(config.default_exec_timeout_secs, 30);
    }

    #[test]
    fn validate_rejects_bad_prefix() {
        let config = PodyConfig {
            name_prefix: Some("a-b".into()),
            ..PodyConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
