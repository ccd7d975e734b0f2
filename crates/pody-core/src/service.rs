//! Typed service facade.
//!
//! [`PodyService`] owns every component and exposes each operation as a
//! plain method taking the authenticated caller. Transport layers (the CLI
//! here) only authenticate, call in, and render the result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pody_common::config::PodyConfig;
use pody_common::constants;
use pody_common::error::{PodyError, Result};
use pody_common::quota::{Quota, QuotaUpdate};
use pody_common::types::Version;
use pody_common::user::User;
use pody_image::registry::{ImageRegistry, ImageView};
use pody_runtime::backend::{self, ContainerRuntime};
use pody_runtime::devices::{self, DeviceQuery};
use pody_runtime::process::{ProcFs, ProcessTable};
use serde::{Deserialize, Serialize};

use crate::help::{self, RouteHelp};
use crate::host::{self, HostSpec};
use crate::identity::{Credentials, UserListing, UserStore};
use crate::ledger::{GpuProcessView, Ledger, Pod, Usage};
use crate::lifecycle::{CommitResult, ExecResult, ManagerSettings, PodManager, PodRequest};
use crate::usage::{self, UsageLog, UsageSampler, UserSelection};

/// Engine, device, and process-table collaborators.
#[derive(Clone)]
pub struct Backends {
    /// Container engine.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// GPU driver.
    pub devices: Arc<dyn DeviceQuery>,
    /// Host process table.
    pub processes: Arc<dyn ProcessTable>,
}

impl Backends {
    /// The real host collaborators. A host without `nvidia-smi` simply has
    /// no GPUs.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeFailure` when `docker` is not installed.
    pub fn detect(config: &PodyConfig) -> Result<Self> {
        Ok(Self {
            runtime: backend::detect_runtime(Duration::from_secs(config.exec_grace_secs))?,
            devices: devices::detect_devices(),
            processes: Arc::new(ProcFs::new()),
        })
    }
}

/// A user's quota next to what they currently hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUsage {
    /// Username.
    pub user: String,
    /// Configured quota.
    pub quota: Quota,
    /// Resources held right now.
    pub usage: Usage,
}

/// The Pody service.
pub struct PodyService {
    config: PodyConfig,
    backends: Backends,
    users: Arc<UserStore>,
    ledger: Arc<Ledger>,
    images: Arc<ImageRegistry>,
    pods: PodManager,
    usage_log: UsageLog,
    sampler: UsageSampler,
}

impl std::fmt::Debug for PodyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodyService")
            .field("data_dir", &self.config.data_dir)
            .field("runtime", &self.backends.runtime.name())
            .finish_non_exhaustive()
    }
}

impl PodyService {
    /// Opens the service on the host's real collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, `docker` is not
    /// installed, or a state file cannot be loaded.
    pub fn open(config: PodyConfig) -> Result<Self> {
        let backends = Backends::detect(&config)?;
        Self::with_backends(config, backends)
    }

    /// Opens the service on the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a state file
    /// cannot be loaded.
    pub fn with_backends(config: PodyConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let port_pool = config.port_pool()?;
        let gpu_pool = match &config.gpu_ids {
            Some(ids) => ids.clone(),
            None => backends.devices.device_ids().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cannot enumerate GPUs, starting with none");
                Vec::new()
            }),
        };
        tracing::info!(
            data_dir = %config.data_dir.display(),
            runtime = backends.runtime.name(),
            gpus = ?gpu_pool,
            ports = port_pool.len(),
            "opening pody service"
        );

        let users = Arc::new(UserStore::open(
            &config.data_file(constants::USERS_FILE),
            config.default_quota,
        )?);
        let ledger = Arc::new(Ledger::open(
            &config.data_file(constants::LEDGER_FILE),
            gpu_pool,
            port_pool,
        )?);
        let images = Arc::new(ImageRegistry::new(Arc::clone(&backends.runtime), &config));
        let pods = PodManager::new(
            Arc::clone(&backends.runtime),
            Arc::clone(&ledger),
            Arc::clone(&images),
            Arc::clone(&users),
            ManagerSettings::from_config(&config),
        );
        Ok(Self {
            usage_log: UsageLog::new(config.data_file(constants::USAGE_LOG_FILE)),
            sampler: UsageSampler::new(Duration::from_secs(config.sample_interval_secs)),
            config,
            backends,
            users,
            ledger,
            images,
            pods,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PodyConfig {
        &self.config
    }

    /// Verifies credentials.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for bad credentials.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<User> {
        self.users.authenticate(credentials)
    }

    /// Details of `name` (the caller by default).
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other users unless the caller is an admin.
    pub fn user_info(&self, caller: &User, name: Option<&str>) -> Result<User> {
        self.users.user_info(caller, name.unwrap_or(&caller.name))
    }

    /// Quota of `name` next to current holdings.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other users unless the caller is an admin.
    pub fn user_usage(&self, caller: &User, name: Option<&str>) -> Result<UserUsage> {
        let user = self.user_info(caller, name)?;
        Ok(UserUsage {
            usage: self.ledger.current_usage(&user.name),
            quota: user.quota,
            user: user.name,
        })
    }

    /// Changes a password (own, or anyone's for admins).
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when changing another user's password without
    /// admin rights.
    pub fn set_password(&self, caller: &User, target: Option<&str>, password: &str) -> Result<()> {
        self.users.set_password(caller, target.unwrap_or(&caller.name), password)
    }

    /// All users.
    #[must_use]
    pub fn list_users(&self, caller: &User) -> UserListing {
        self.users.list_users(caller)
    }

    /// Provisions a user.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-admin callers.
    pub fn add_user(
        &self,
        caller: &User,
        name: &str,
        password: &str,
        is_admin: bool,
        quota: Option<Quota>,
    ) -> Result<User> {
        self.users.add_user(caller, name, password, is_admin, quota)
    }

    /// Updates role and quota of a user.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-admin callers.
    pub fn update_user(
        &self,
        caller: &User,
        name: &str,
        is_admin: Option<bool>,
        quota: &QuotaUpdate,
    ) -> Result<User> {
        self.users.update_user(caller, name, is_admin, quota)
    }

    /// Local administrator provisioning without a caller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for bad names or missing passwords.
    pub fn bootstrap_user(
        &self,
        name: &str,
        password: Option<&str>,
        is_admin: Option<bool>,
        quota: &QuotaUpdate,
    ) -> Result<User> {
        self.users.bootstrap_user(name, password, is_admin, quota)
    }

    /// See [`PodManager::create`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn create_pod(&self, caller: &User, ins: &str, image: &str, request: &PodRequest) -> Result<Pod> {
        self.pods.create(caller, ins, image, request)
    }

    /// See [`PodManager::delete`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn delete_pod(&self, caller: &User, ins: &str) -> Result<String> {
        self.pods.delete(caller, ins)
    }

    /// See [`PodManager::start`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn start_pod(&self, caller: &User, ins: &str) -> Result<String> {
        self.pods.start(caller, ins)
    }

    /// See [`PodManager::stop`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn stop_pod(&self, caller: &User, ins: &str) -> Result<()> {
        self.pods.stop(caller, ins)
    }

    /// See [`PodManager::restart`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn restart_pod(&self, caller: &User, ins: &str) -> Result<String> {
        self.pods.restart(caller, ins)
    }

    /// See [`PodManager::inspect`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn inspect_pod(&self, caller: &User, ins: &str) -> Result<Pod> {
        self.pods.inspect(caller, ins)
    }

    /// See [`PodManager::list`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn list_pods(&self, caller: &User, owner: Option<&str>) -> Result<Vec<String>> {
        self.pods.list(caller, owner)
    }

    /// See [`PodManager::exec`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn exec_pod(&self, caller: &User, ins: &str, cmd: &str, timeout: Option<Duration>) -> Result<ExecResult> {
        self.pods.exec(caller, ins, cmd, timeout)
    }

    /// See [`PodManager::commit`].
    ///
    /// # Errors
    ///
    /// Propagates lifecycle errors.
    pub fn commit_pod(
        &self,
        caller: &User,
        ins: &str,
        tag: Option<&str>,
        message: Option<&str>,
    ) -> Result<CommitResult> {
        self.pods.commit(caller, ins, tag, message)
    }

    /// Images visible to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot list images.
    pub fn list_images(&self, caller: &User) -> Result<Vec<ImageView>> {
        self.images.list(caller)
    }

    /// One visible image.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or invisible images.
    pub fn inspect_image(&self, caller: &User, image: &str) -> Result<ImageView> {
        self.images.inspect(caller, image)
    }

    /// Deletes a committed image.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for base images and other users' images.
    pub fn delete_image(&self, caller: &User, image: &str) -> Result<()> {
        self.images.delete(caller, image)
    }

    /// Processes on the given devices (all managed devices by default).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for devices outside the pool and an error if
    /// the driver cannot be queried.
    pub fn gpu_processes(&self, ids: Option<&[u32]>) -> Result<BTreeMap<u32, Vec<GpuProcessView>>> {
        let pool = self.ledger.gpu_pool();
        let ids = ids.unwrap_or(pool);
        if let Some(bad) = ids.iter().find(|id| !pool.contains(*id)) {
            return Err(PodyError::invalid(format!("GPU {bad} is not managed by this host")));
        }
        self.ledger
            .gpu_processes(ids, self.backends.devices.as_ref(), self.backends.processes.as_ref())
    }

    fn selection(caller: &User, users: Option<&[String]>) -> Result<UserSelection> {
        match users {
            None if caller.is_admin => Ok(UserSelection::All),
            None => Ok(UserSelection::Only([caller.name.clone()].into())),
            Some(list) => {
                if let Some(other) = list.iter().find(|u| !caller.can_act_for(u)) {
                    return Err(PodyError::forbidden(format!("cannot view usage of {other}")));
                }
                Ok(UserSelection::Only(list.iter().cloned().collect()))
            }
        }
    }

    fn window(since: Option<&str>) -> Result<Option<i64>> {
        let now = chrono::Utc::now().timestamp();
        since.map(|s| usage::parse_since(s, now)).transpose()
    }

    /// CPU seconds per user since `since`. Non-admins only see
    /// themselves.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other users, `InvalidInput` for a bad
    /// window, or an error if the usage log cannot be read.
    pub fn cpu_time(&self, caller: &User, users: Option<&[String]>, since: Option<&str>) -> Result<BTreeMap<String, f64>> {
        let selection = Self::selection(caller, users)?;
        let since = Self::window(since)?;
        Ok(usage::cpu_time(&self.usage_log.read()?, &selection, since))
    }

    /// GPU seconds per user since `since`. Non-admins only see
    /// themselves.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other users, `InvalidInput` for a bad
    /// window, or an error if the usage log cannot be read.
    pub fn gpu_time(&self, caller: &User, users: Option<&[String]>, since: Option<&str>) -> Result<BTreeMap<String, f64>> {
        let selection = Self::selection(caller, users)?;
        let since = Self::window(since)?;
        Ok(usage::gpu_time(&self.usage_log.read()?, &selection, since))
    }

    /// Samples usage at unix time `now` and appends it to the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver cannot be queried or the log cannot
    /// be written.
    pub fn sample_usage(&self, now: i64) -> Result<usize> {
        let records = self.sampler.sample(
            now,
            &self.ledger,
            self.backends.processes.as_ref(),
            self.backends.devices.as_ref(),
        )?;
        self.usage_log.append(&records)?;
        Ok(records.len())
    }

    /// Refreshes every pod's status; returns the number that changed.
    #[must_use]
    pub fn reconcile(&self) -> usize {
        self.pods.reconcile()
    }

    /// Operations matching `path`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing matches.
    pub fn help(&self, path: &str) -> Result<Vec<RouteHelp>> {
        help::help(path)
    }

    /// Service version.
    #[must_use]
    pub fn version(&self) -> Version {
        help::version()
    }

    /// Host software versions.
    #[must_use]
    pub fn host_spec(&self) -> HostSpec {
        host::host_spec(self.backends.runtime.as_ref(), self.backends.devices.as_ref())
    }
}
