//! Authenticated principal.

use serde::{Deserialize, Serialize};

use crate::quota::Quota;

/// A user as seen by the lifecycle core once credentials are verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique, immutable username.
    pub name: String,
    /// Whether the user may act on other users' resources.
    pub is_admin: bool,
    /// Resource quota.
    pub quota: Quota,
}

impl User {
    /// Whether this user may act on resources owned by `owner`.
    #[must_use]
    pub fn can_act_for(&self, owner: &str) -> bool {
        self.is_admin || self.name == owner
    }
}
