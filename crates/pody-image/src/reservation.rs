//! Provisional commit-quota accounting.
//!
//! A commit can take minutes. While it runs, the image does not yet show
//! up in the engine's listing, so concurrent commits by the same user
//! would each see the old count. Pending commits are therefore counted
//! here until the reservation is dropped.
//!
//! Each reservation also names a private staging reference. The engine
//! commits to that first; the final tag only moves once the new image
//! passed the size check, so a rejected re-commit never costs the owner
//! the image the tag pointed at before.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Pending commit counts per user.
#[derive(Debug, Default)]
pub struct PendingCommits {
    counts: Mutex<HashMap<String, usize>>,
}

impl PendingCommits {
    /// Number of commits in flight for `owner`.
    #[must_use]
    pub fn pending(&self, owner: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .copied()
            .unwrap_or(0)
    }

    fn adjust(&self, owner: &str, up: bool) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if up {
            *counts.entry(owner.to_string()).or_default() += 1;
            return;
        }
        if let Some(n) = counts.get_mut(owner) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                let _ = counts.remove(owner);
            }
        }
    }
}

/// A commit slot held for one user. Dropping it frees the slot.
#[derive(Debug)]
pub struct CommitReservation {
    pending: Arc<PendingCommits>,
    owner: String,
    image: String,
    staging: String,
}

impl CommitReservation {
    pub(crate) fn acquire(pending: &Arc<PendingCommits>, owner: &str, image: String, staging: String) -> Self {
        pending.adjust(owner, true);
        Self {
            pending: Arc::clone(pending),
            owner: owner.to_string(),
            image,
            staging,
        }
    }

    /// Owner of the reserved slot.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Full image reference the commit will produce.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Unique reference the engine commits to before the final tag moves.
    #[must_use]
    pub fn staging(&self) -> &str {
        &self.staging
    }
}

impl Drop for CommitReservation {
    fn drop(&mut self) {
        self.pending.adjust(&self.owner, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_slot() {
        let pending = Arc::new(PendingCommits::default());
        let a = CommitReservation::acquire(&pending, "alice", "pody-commit:alice".into(), "s:1".into());
        let b = CommitReservation::acquire(&pending, "alice", "pody-commit:alice-x".into(), "s:2".into());
        assert_eq!(pending.pending("alice"), 2);
        assert_eq!(pending.pending("bob"), 0);
        drop(a);
        assert_eq!(pending.pending("alice"), 1);
        assert_eq!(b.image(), "pody-commit:alice-x");
        assert_eq!(b.staging(), "s:2");
        drop(b);
        assert_eq!(pending.pending("alice"), 0);
    }
}
