//! Host software versions.

use pody_common::types::Version;
use pody_runtime::backend::ContainerRuntime;
use pody_runtime::devices::DeviceQuery;
use serde::{Deserialize, Serialize};

/// Versions of the software stack pods run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// This service.
    pub pody_version: Version,
    /// Container engine; `None` if it did not answer.
    pub runtime_version: Option<String>,
    /// GPU driver.
    pub driver_version: Option<String>,
    /// GPU container toolkit.
    pub toolkit_version: Option<String>,
}

/// Collects the host spec. Collaborators that fail are reported as
/// unknown rather than failing the whole query.
#[must_use]
pub fn host_spec(runtime: &dyn ContainerRuntime, devices: &dyn DeviceQuery) -> HostSpec {
    let runtime_version = runtime
        .version()
        .inspect_err(|e| tracing::warn!(runtime = runtime.name(), error = %e, "runtime version unavailable"))
        .ok();
    let spec = devices
        .spec()
        .inspect_err(|e| tracing::warn!(error = %e, "device spec unavailable"))
        .unwrap_or_default();
    HostSpec {
        pody_version: crate::help::version(),
        runtime_version,
        driver_version: spec.driver_version,
        toolkit_version: spec.toolkit_version,
    }
}
