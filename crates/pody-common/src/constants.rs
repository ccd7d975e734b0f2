//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for Pody data when no home directory is usable.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/pody";

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "PODY_HOME";

/// Returns the data directory: `$PODY_HOME`, then `$HOME/.pody`,
/// falling back to `/var/lib/pody`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".pody");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Configuration file name inside the data directory.
pub const CONFIG_FILE: &str = "config.yaml";
/// User database file name inside the data directory.
pub const USERS_FILE: &str = "users.json";
/// Ledger state file name inside the data directory.
pub const LEDGER_FILE: &str = "ledger.json";
/// Usage log file name inside the data directory.
pub const USAGE_LOG_FILE: &str = "usage.jsonl";

/// Default repository name for committed images.
pub const DEFAULT_COMMIT_NAME: &str = "pody-commit";

/// Default `exec` timeout in seconds.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;

/// Grace period between SIGTERM and SIGKILL for timed-out commands.
pub const DEFAULT_EXEC_GRACE_SECS: u64 = 2;

/// Default interval between usage samples in seconds.
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 60;

/// Number of log lines returned after start/restart.
pub const START_LOG_TAIL: usize = 100;

/// Label the runtime attaches to pods so they can be traced to an owner.
pub const OWNER_LABEL: &str = "pody.owner";

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "pody";
