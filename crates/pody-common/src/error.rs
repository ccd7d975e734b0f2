//! Unified error types for the Pody workspace.
//!
//! Every fallible operation in the core returns [`PodyError`]. The variants
//! form the user-visible taxonomy; each maps onto a stable [`ErrorKind`]
//! that the outer shell can turn into a status code.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quota dimension that an operation would have exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    /// Number of pods owned by the user.
    Pods,
    /// Number of GPU devices held by the user.
    Gpus,
    /// Per-pod memory limit.
    Memory,
    /// Per-pod shared-memory size.
    SharedMemory,
    /// Per-pod writable storage size.
    Storage,
    /// Host ports available for port mappings.
    Ports,
    /// Number of committed images owned by the user.
    ImageCount,
    /// Aggregate size of committed images owned by the user.
    ImageSize,
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pods => "pod count",
            Self::Gpus => "gpu count",
            Self::Memory => "memory limit",
            Self::SharedMemory => "shm size",
            Self::Storage => "storage size",
            Self::Ports => "host ports",
            Self::ImageCount => "committed image count",
            Self::ImageSize => "committed image size",
        };
        f.write_str(s)
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum PodyError {
    /// Credentials were missing or did not match any user.
    #[error("unauthorized: invalid username or password")]
    Unauthorized,

    /// The caller is authenticated but not allowed to perform the operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Why the operation was refused.
        message: String,
    },

    /// A pod, image, or user does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The owner already has a pod with this instance tag.
    #[error("pod {name} already exists")]
    NameConflict {
        /// Full pod name that collided.
        name: String,
    },

    /// The operation would push the user over a finite quota.
    #[error("quota exceeded ({resource}): {message}")]
    QuotaExceeded {
        /// Quota dimension that was exceeded.
        resource: QuotaResource,
        /// Human-readable detail.
        message: String,
    },

    /// `start` on a pod that is already running.
    #[error("pod {pod} is already running")]
    AlreadyRunning {
        /// Full pod name.
        pod: String,
    },

    /// An operation that requires a running pod found it stopped.
    #[error("pod {pod} is not running")]
    NotRunning {
        /// Full pod name.
        pod: String,
    },

    /// A bounded operation exceeded its deadline and was terminated.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline in seconds.
        seconds: u64,
    },

    /// The container runtime or device driver reported a failure.
    #[error("runtime failure: {message}")]
    RuntimeFailure {
        /// Diagnostic text from the runtime.
        message: String,
    },

    /// A caller-supplied value failed validation.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid value.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Stable classification of a [`PodyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing credentials.
    Unauthorized,
    /// Not permitted for this caller.
    Forbidden,
    /// Target does not exist.
    NotFound,
    /// Duplicate instance tag.
    NameConflict,
    /// Quota would be exceeded.
    QuotaExceeded,
    /// Pod already running.
    AlreadyRunning,
    /// Pod not running.
    NotRunning,
    /// Deadline exceeded.
    Timeout,
    /// Runtime collaborator failed.
    RuntimeFailure,
    /// Caller input rejected.
    InvalidInput,
    /// Anything internal to the service.
    Internal,
}

/// Serializable error descriptor handed to the outer shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl PodyError {
    /// Shorthand for a [`PodyError::Forbidden`].
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Shorthand for a [`PodyError::InvalidInput`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Shorthand for a [`PodyError::RuntimeFailure`].
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeFailure {
            message: message.into(),
        }
    }

    /// Shorthand for a [`PodyError::QuotaExceeded`].
    pub fn quota(resource: QuotaResource, message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            resource,
            message: message.into(),
        }
    }

    /// Returns the taxonomy entry for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NameConflict { .. } => ErrorKind::NameConflict,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RuntimeFailure { .. } => ErrorKind::RuntimeFailure,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Config { .. } | Self::Io { .. } | Self::Serialization { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Builds the user-visible report.
    ///
    /// Internal failures (I/O, configuration, serialization) carry host
    /// paths and parser details; only admins see those.
    #[must_use]
    pub fn report(&self, is_admin: bool) -> ErrorReport {
        let kind = self.kind();
        let message = if kind == ErrorKind::Internal && !is_admin {
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        ErrorReport { kind, message }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PodyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_every_internal_variant() {
        let err = PodyError::Config {
            message: "bad".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = PodyError::Io {
            path: "/x".into(),
            source: std::io::Error::other("boom"),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn report_hides_internal_details_from_users() {
        let err = PodyError::Io {
            path: "/var/lib/pody/users.json".into(),
            source: std::io::Error::other("disk full"),
        };
        let user = err.report(false);
        assert_eq!(user.message, "internal server error");
        let admin = err.report(true);
        assert!(admin.message.contains("users.json"));
    }

    #[test]
    fn report_keeps_runtime_diagnostics() {
        let err = PodyError::runtime("no space left on device");
        let report = err.report(false);
        assert_eq!(report.kind, ErrorKind::RuntimeFailure);
        assert!(report.message.contains("no space left"));
    }

    #[test]
    fn quota_message_names_resource() {
        let err = PodyError::quota(QuotaResource::Pods, "limit is 2");
        assert_eq!(err.to_string(), "quota exceeded (pod count): limit is 2");
    }
}
