//! Per-user quota model.
//!
//! Quota fields are exchanged as plain integers where `-1` means "no
//! limit". Internally every field is a [`Limit`] so arithmetic never
//! touches the sentinel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PodyError, QuotaResource, Result};

/// Wire value meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// A single quota bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Limit {
    /// No bound.
    #[default]
    Unlimited,
    /// Inclusive upper bound.
    Limited(u64),
}

impl Limit {
    /// Converts the wire representation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for negative values other than `-1`.
    pub fn from_wire(value: i64) -> Result<Self> {
        match value {
            UNLIMITED => Ok(Self::Unlimited),
            v if v >= 0 => Ok(Self::Limited(v.unsigned_abs())),
            v => Err(PodyError::invalid(format!(
                "quota value {v} must be -1 (unlimited) or non-negative"
            ))),
        }
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Unlimited => UNLIMITED,
            Self::Limited(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    /// Whether `total` stays within the bound.
    #[must_use]
    pub const fn allows(self, total: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(n) => total <= n,
        }
    }

    /// The bound, if any.
    #[must_use]
    pub const fn value(self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Limited(n) => Some(n),
        }
    }

    /// Whether the bound is finite.
    #[must_use]
    pub const fn is_limited(self) -> bool {
        matches!(self, Self::Limited(_))
    }

    /// Ensures `requested` fits under this per-item cap.
    ///
    /// An unlimited request against a finite cap is a violation.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` for `resource` when the request is larger.
    pub fn check_cap(self, requested: Self, resource: QuotaResource) -> Result<()> {
        match (self, requested) {
            (Self::Unlimited, _) => Ok(()),
            (Self::Limited(cap), Self::Limited(req)) if req <= cap => Ok(()),
            (Self::Limited(cap), req) => Err(PodyError::quota(
                resource,
                format!("requested {req}, limit is {cap}"),
            )),
        }
    }

    /// Resolves an optional per-item request against this cap.
    ///
    /// Missing requests default to the cap itself.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` if the explicit request is above the cap.
    pub fn resolve_request(self, requested: Option<u64>, resource: QuotaResource) -> Result<Self> {
        let resolved = requested.map_or(self, Self::Limited);
        self.check_cap(resolved, resource)?;
        Ok(resolved)
    }
}

impl TryFrom<i64> for Limit {
    type Error = PodyError;

    fn try_from(value: i64) -> Result<Self> {
        Self::from_wire(value)
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        limit.to_wire()
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Limited(n) => write!(f, "{n}"),
        }
    }
}

/// Resource quota attached to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quota {
    /// Maximum number of pods.
    pub max_pods: Limit,
    /// Maximum number of GPU devices held across all pods.
    pub gpu_count: Limit,
    /// Per-pod memory limit in bytes.
    pub memory_limit: Limit,
    /// Per-pod writable storage in bytes.
    pub storage_size: Limit,
    /// Per-pod shared-memory size in bytes.
    pub shm_size: Limit,
    /// Maximum number of committed images.
    pub commit_count: Limit,
    /// Maximum aggregate size of committed images in bytes.
    pub commit_size: Limit,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_pods: Limit::Limited(1),
            gpu_count: Limit::Unlimited,
            memory_limit: Limit::Unlimited,
            storage_size: Limit::Unlimited,
            shm_size: Limit::Unlimited,
            commit_count: Limit::Unlimited,
            commit_size: Limit::Unlimited,
        }
    }
}

impl Quota {
    /// A quota with every field unlimited.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_pods: Limit::Unlimited,
            gpu_count: Limit::Unlimited,
            memory_limit: Limit::Unlimited,
            storage_size: Limit::Unlimited,
            shm_size: Limit::Unlimited,
            commit_count: Limit::Unlimited,
            commit_size: Limit::Unlimited,
        }
    }
}

/// Partial quota update; `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUpdate {
    /// New pod limit.
    pub max_pods: Option<Limit>,
    /// New GPU limit.
    pub gpu_count: Option<Limit>,
    /// New per-pod memory limit.
    pub memory_limit: Option<Limit>,
    /// New per-pod storage limit.
    pub storage_size: Option<Limit>,
    /// New per-pod shm size.
    pub shm_size: Option<Limit>,
    /// New committed image count limit.
    pub commit_count: Option<Limit>,
    /// New committed image size limit.
    pub commit_size: Option<Limit>,
}

impl QuotaUpdate {
    /// Applies the update to `quota`.
    pub fn apply(&self, quota: &mut Quota) {
        let fields = [
            (&mut quota.max_pods, self.max_pods),
            (&mut quota.gpu_count, self.gpu_count),
            (&mut quota.memory_limit, self.memory_limit),
            (&mut quota.storage_size, self.storage_size),
            (&mut quota.shm_size, self.shm_size),
            (&mut quota.commit_count, self.commit_count),
            (&mut quota.commit_size, self.commit_size),
        ];
        for (slot, value) in fields {
            if let Some(v) = value {
                *slot = v;
            }
        }
    }
}
