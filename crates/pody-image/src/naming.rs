//! Committed image naming.
//!
//! A committed image is tagged `<commit_name>:<owner>[-<tag>]`. Owners are
//! alphanumeric, so the first `-` after the colon always separates the
//! owner from the tag.

use std::fmt;

use pody_common::error::Result;
use pody_common::types::{validate_instance, validate_username};

/// Owner and optional tag of a committed image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitName {
    owner: String,
    tag: Option<String>,
}

impl CommitName {
    /// Builds a validated commit name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed owner or tag.
    pub fn new(owner: &str, tag: Option<&str>) -> Result<Self> {
        validate_username(owner)?;
        if let Some(t) = tag {
            validate_instance(t)?;
        }
        Ok(Self {
            owner: owner.to_string(),
            tag: tag.map(str::to_string),
        })
    }

    /// Parses the short form `<owner>[-<tag>]`.
    #[must_use]
    pub fn parse_short(short: &str) -> Option<Self> {
        match short.split_once('-') {
            Some((owner, tag)) => Self::new(owner, Some(tag)).ok(),
            None => Self::new(short, None).ok(),
        }
    }

    /// Parses a full image reference under the `repository` used for
    /// commits. Returns `None` for images outside that repository.
    #[must_use]
    pub fn parse_full(repository: &str, image: &str) -> Option<Self> {
        image
            .strip_prefix(repository)
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(Self::parse_short)
    }

    /// Owning username.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Full image reference under `repository`.
    #[must_use]
    pub fn full(&self, repository: &str) -> String {
        format!("{repository}:{self}")
    }
}

/// Short form `<owner>[-<tag>]`.
impl fmt::Display for CommitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}-{tag}", self.owner),
            None => f.write_str(&self.owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_short_forms() {
        let name = CommitName::new("alice", Some("v1")).unwrap();
        assert_eq!(name.to_string(), "alice-v1");
        assert_eq!(name.full("pody-commit"), "pody-commit:alice-v1");

        let untagged = CommitName::new("alice", None).unwrap();
        assert_eq!(untagged.full("pody-commit"), "pody-commit:alice");
    }

    #[test]
    fn parse_full_only_accepts_commit_repository() {
        let parsed = CommitName::parse_full("pody-commit", "pody-commit:bob-exp.2").unwrap();
        assert_eq!(parsed.owner(), "bob");
        assert_eq!(parsed.tag(), Some("exp.2"));

        assert!(CommitName::parse_full("pody-commit", "ubuntu:22.04").is_none());
        assert!(CommitName::parse_full("pody-commit", "pody-commits:bob").is_none());
    }

    #[test]
    fn invalid_tags_are_rejected() {
        assert!(CommitName::new("alice", Some("a-b")).is_err());
        assert!(CommitName::new("alice", Some("")).is_err());
        assert!(CommitName::parse_short("al").is_none());
    }
}
