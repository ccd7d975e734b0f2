//! Identity and quota store.
//!
//! Users live in `users.json` together with a credential digest
//! `sha256("<name>:<password>")`. Every mutation rewrites the file
//! atomically before returning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pody_common::error::{PodyError, Result};
use pody_common::quota::{Quota, QuotaUpdate};
use pody_common::types::validate_username;
use pody_common::user::User;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::state;

/// Username and password presented by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Plain-text password.
    pub password: String,
}

impl Credentials {
    /// Bundles a username and password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Name and role of a user, as shown to admins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// Username.
    pub name: String,
    /// Admin flag.
    pub is_admin: bool,
}

/// Result of [`UserStore::list_users`]; its shape depends on the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserListing {
    /// Names with roles, for admins.
    Detailed(Vec<UserSummary>),
    /// Names only, for everyone else.
    Names(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    credential: String,
    is_admin: bool,
    #[serde(default)]
    quota: Quota,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDb {
    users: BTreeMap<String, UserRecord>,
}

/// Hex digest of `"<name>:<password>"`.
#[must_use]
pub fn credential_digest(name: &str, password: &str) -> String {
    Sha256::digest(format!("{name}:{password}").as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(PodyError::invalid("password must not be empty"));
    }
    Ok(())
}

fn require_admin(caller: &User, action: &str) -> Result<()> {
    if caller.is_admin {
        Ok(())
    } else {
        Err(PodyError::forbidden(format!("only admins may {action}")))
    }
}

fn user_not_found(name: &str) -> PodyError {
    PodyError::NotFound {
        kind: "user",
        id: name.to_string(),
    }
}

/// File-backed user database.
#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    default_quota: Quota,
    db: Mutex<UserDb>,
}

impl UserStore {
    /// Opens (or starts) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(path: &Path, default_quota: Quota) -> Result<Self> {
        let db: UserDb = state::load_json(path)?;
        tracing::debug!(path = %path.display(), users = db.users.len(), "user store opened");
        Ok(Self {
            path: path.to_path_buf(),
            default_quota,
            db: Mutex::new(db),
        })
    }

    /// Current database, reloaded under a shared lock. Falls back to the
    /// last loaded copy if the file cannot be read.
    fn read(&self) -> MutexGuard<'_, UserDb> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        match state::lock(&self.path, false).and_then(|_lock| state::load_json::<UserDb>(&self.path)) {
            Ok(fresh) => *db = fresh,
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "serving cached user store"),
        }
        db
    }

    /// Applies `f` to the database on disk under an exclusive lock and
    /// persists it. The in-memory copy is only replaced once the file is
    /// written.
    fn mutate<T>(&self, f: impl FnOnce(&mut UserDb) -> Result<T>) -> Result<T> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = state::lock(&self.path, true)?;
        let mut next: UserDb = state::load_json(&self.path)?;
        let out = f(&mut next)?;
        state::save_json(&self.path, &next)?;
        *db = next;
        Ok(out)
    }

    fn to_user(name: &str, record: &UserRecord) -> User {
        User {
            name: name.to_string(),
            is_admin: record.is_admin,
            quota: record.quota,
        }
    }

    /// Verifies credentials.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for unknown users and wrong passwords alike.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<User> {
        let db = self.read();
        let record = db
            .users
            .get(&credentials.username)
            .filter(|r| r.credential == credential_digest(&credentials.username, &credentials.password))
            .ok_or(PodyError::Unauthorized)?;
        Ok(Self::to_user(&credentials.username, record))
    }

    /// Looks up a user without credentials.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown users.
    pub fn get(&self, name: &str) -> Result<User> {
        let db = self.read();
        db.users
            .get(name)
            .map(|r| Self::to_user(name, r))
            .ok_or_else(|| user_not_found(name))
    }

    /// Quota of `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown users.
    pub fn get_quota(&self, name: &str) -> Result<Quota> {
        self.get(name).map(|u| u.quota)
    }

    /// Details of `name`, visible to that user and to admins.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other users' details, `NotFound` for unknown
    /// users.
    pub fn user_info(&self, caller: &User, name: &str) -> Result<User> {
        if !caller.can_act_for(name) {
            return Err(PodyError::forbidden("cannot view another user"));
        }
        self.get(name)
    }

    /// Changes the password of `target`.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` unless the caller is `target` or an admin,
    /// `NotFound` for unknown users, and `InvalidInput` for empty passwords.
    pub fn set_password(&self, caller: &User, target: &str, password: &str) -> Result<()> {
        if !caller.can_act_for(target) {
            return Err(PodyError::forbidden("cannot change another user's password"));
        }
        validate_password(password)?;
        self.mutate(|db| {
            let record = db.users.get_mut(target).ok_or_else(|| user_not_found(target))?;
            record.credential = credential_digest(target, password);
            Ok(())
        })?;
        tracing::info!(user = %target, by = %caller.name, "password changed");
        Ok(())
    }

    /// All users ordered by name; admins also see roles.
    #[must_use]
    pub fn list_users(&self, caller: &User) -> UserListing {
        let db = self.read();
        if caller.is_admin {
            UserListing::Detailed(
                db.users
                    .iter()
                    .map(|(name, r)| UserSummary {
                        name: name.clone(),
                        is_admin: r.is_admin,
                    })
                    .collect(),
            )
        } else {
            UserListing::Names(db.users.keys().cloned().collect())
        }
    }

    fn insert(&self, name: &str, password: &str, is_admin: bool, quota: Option<Quota>) -> Result<User> {
        validate_username(name)?;
        validate_password(password)?;
        let record = UserRecord {
            credential: credential_digest(name, password),
            is_admin,
            quota: quota.unwrap_or(self.default_quota),
        };
        let user = Self::to_user(name, &record);
        self.mutate(|db| {
            if db.users.contains_key(name) {
                return Err(PodyError::InvalidInput {
                    message: format!("user {name} already exists"),
                });
            }
            let _ = db.users.insert(name.to_string(), record);
            Ok(())
        })?;
        tracing::info!(user = %name, is_admin, "user added");
        Ok(user)
    }

    /// Provisions a new user. `quota` defaults to the configured default.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-admin callers, `InvalidInput` for bad
    /// names, empty passwords, or existing users.
    pub fn add_user(
        &self,
        caller: &User,
        name: &str,
        password: &str,
        is_admin: bool,
        quota: Option<Quota>,
    ) -> Result<User> {
        require_admin(caller, "add users")?;
        self.insert(name, password, is_admin, quota)
    }

    /// Changes the role and/or quota of `name`.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for non-admin callers and `NotFound` for unknown
    /// users.
    pub fn update_user(
        &self,
        caller: &User,
        name: &str,
        is_admin: Option<bool>,
        quota: &QuotaUpdate,
    ) -> Result<User> {
        require_admin(caller, "update users")?;
        self.apply_update(name, is_admin, quota)
    }

    fn apply_update(&self, name: &str, is_admin: Option<bool>, quota: &QuotaUpdate) -> Result<User> {
        let user = self.mutate(|db| {
            let record = db.users.get_mut(name).ok_or_else(|| user_not_found(name))?;
            if let Some(flag) = is_admin {
                record.is_admin = flag;
            }
            quota.apply(&mut record.quota);
            Ok(Self::to_user(name, record))
        })?;
        tracing::info!(user = %name, is_admin = user.is_admin, "user updated");
        Ok(user)
    }

    /// Local provisioning path for the host administrator: creates `name`
    /// or, if it exists, resets its password and applies the update.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for bad names or empty passwords.
    pub fn bootstrap_user(
        &self,
        name: &str,
        password: Option<&str>,
        is_admin: Option<bool>,
        quota: &QuotaUpdate,
    ) -> Result<User> {
        if self.get(name).is_err() {
            let mut initial = self.default_quota;
            quota.apply(&mut initial);
            let password = password.ok_or_else(|| PodyError::invalid("a new user needs a password"))?;
            return self.insert(name, password, is_admin.unwrap_or(false), Some(initial));
        }
        if let Some(password) = password {
            validate_password(password)?;
            self.mutate(|db| {
                if let Some(record) = db.users.get_mut(name) {
                    record.credential = credential_digest(name, password);
                }
                Ok(())
            })?;
        }
        self.apply_update(name, is_admin, quota)
    }
}

#[cfg(test)]
mod tests {
    use pody_common::quota::Limit;

    use super::*;

    fn store(dir: &Path) -> UserStore {
        UserStore::open(&dir.join("users.json"), Quota::default()).expect("open")
    }

    fn admin(store: &UserStore) -> User {
        store
            .bootstrap_user("root1", Some("pw"), Some(true), &QuotaUpdate::default())
            .expect("bootstrap")
    }

    #[test]
    fn authenticate_checks_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let root = admin(&store);
        let _ = store.add_user(&root, "alice", "secret", false, None).unwrap();

        let alice = store.authenticate(&Credentials::new("alice", "secret")).unwrap();
        assert!(!alice.is_admin);
        assert_eq!(alice.quota.max_pods, Limit::Limited(1));
        assert!(matches!(
            store.authenticate(&Credentials::new("alice", "wrong")),
            Err(PodyError::Unauthorized)
        ));
        assert!(matches!(
            store.authenticate(&Credentials::new("nobody", "secret")),
            Err(PodyError::Unauthorized)
        ));
    }

    #[test]
    fn digest_matches_known_value() {
        assert_eq!(
            credential_digest("alice", "secret"),
            "3d11dc479c08e3b368773103d64766c2e420ce39727932fcf2d8f4d9d599be59"
        );
        assert_ne!(credential_digest("alice", "secret"), credential_digest("bob", "secret"));
    }

    #[test]
    fn users_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = store(dir.path());
            let root = admin(&store);
            let _ = store.add_user(&root, "alice", "secret", false, None).unwrap();
        }
        let reopened = store(dir.path());
        assert!(reopened.authenticate(&Credentials::new("alice", "secret")).is_ok());
    }

    #[test]
    fn stores_sharing_a_file_keep_each_others_users() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = store(dir.path());
        let second = store(dir.path());
        let root = admin(&first);

        let _ = second.add_user(&root, "bob", "b1", false, None).unwrap();
        let _ = first.add_user(&root, "alice", "a1", false, None).unwrap();

        assert!(second.authenticate(&Credentials::new("alice", "a1")).is_ok());
        let reopened = store(dir.path());
        assert!(reopened.authenticate(&Credentials::new("bob", "b1")).is_ok());
        assert!(reopened.authenticate(&Credentials::new("root1", "pw")).is_ok());
    }

    #[test]
    fn password_change_requires_self_or_admin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let root = admin(&store);
        let alice = store.add_user(&root, "alice", "a1", false, None).unwrap();
        let bob = store.add_user(&root, "bob", "b1", false, None).unwrap();

        assert!(matches!(
            store.set_password(&bob, "alice", "x"),
            Err(PodyError::Forbidden { .. })
        ));
        store.set_password(&alice, "alice", "a2").unwrap();
        assert!(store.authenticate(&Credentials::new("alice", "a2")).is_ok());
        store.set_password(&root, "alice", "a3").unwrap();
        assert!(store.authenticate(&Credentials::new("alice", "a3")).is_ok());
    }

    #[test]
    fn listing_depends_on_role() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let root = admin(&store);
        let bob = store.add_user(&root, "bob", "b1", false, None).unwrap();
        let _ = store.add_user(&root, "alice", "a1", false, None).unwrap();

        assert_eq!(
            store.list_users(&bob),
            UserListing::Names(vec!["alice".into(), "bob".into(), "root1".into()])
        );
        assert!(matches!(
            store.list_users(&root),
            UserListing::Detailed(ref rows)
                if rows.len() == 3 && rows.iter().any(|r| r.name == "root1" && r.is_admin)
        ));
    }

    #[test]
    fn only_admins_provision_and_update() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let root = admin(&store);
        let alice = store.add_user(&root, "alice", "a1", false, None).unwrap();

        assert!(matches!(
            store.add_user(&alice, "eve", "e1", false, None),
            Err(PodyError::Forbidden { .. })
        ));
        let update = QuotaUpdate {
            gpu_count: Some(Limit::Limited(2)),
            ..QuotaUpdate::default()
        };
        assert!(store.update_user(&alice, "alice", Some(true), &update).is_err());

        let updated = store.update_user(&root, "alice", None, &update).unwrap();
        assert_eq!(updated.quota.gpu_count, Limit::Limited(2));
        assert_eq!(store.get_quota("alice").unwrap().gpu_count, Limit::Limited(2));
        assert!(matches!(store.get_quota("zed"), Err(PodyError::NotFound { .. })));
    }

    #[test]
    fn invalid_usernames_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let root = admin(&store);
        assert!(store.add_user(&root, "a-b", "pw", false, None).is_err());
        assert!(store.add_user(&root, "root1", "pw", false, None).is_err());
    }
}
