//! Per-caller view over the engine's image store.
//!
//! Visible images are the configured base images present in the engine
//! plus committed images. Non-admins only see their own committed images,
//! under the short name `<user>[-<tag>]`; admins see every committed image
//! under its full reference.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pody_common::config::{ImageConfig, ImageSourcePolicy, PodyConfig};
use pody_common::error::{PodyError, QuotaResource, Result};
use pody_common::quota::Limit;
use pody_common::user::User;
use pody_runtime::backend::{ContainerRuntime, ImageInfo};
use serde::{Deserialize, Serialize};

use crate::naming::CommitName;
use crate::reservation::{CommitReservation, PendingCommits};

/// Origin of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Configured base image.
    Base,
    /// Image committed from a pod.
    Committed,
}

/// An image as presented to one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageView {
    /// Name shown to the caller.
    pub name: String,
    /// Full engine reference.
    pub image: String,
    /// Base or committed.
    pub kind: ImageKind,
    /// Owner of a committed image.
    pub owner: Option<String>,
    /// Content hash.
    pub id: String,
    /// Commit comment or base image description.
    pub comment: String,
    /// Size in bytes.
    pub size: u64,
    /// Exposed port specs.
    pub exposed_ports: BTreeSet<String>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

/// Image a pod may be created from, with the container ports to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Full engine reference.
    pub image: String,
    /// Container ports that get a host port.
    pub ports: Vec<u16>,
    /// Base or committed.
    pub kind: ImageKind,
}

#[derive(Debug, Clone)]
enum Origin {
    Base(ImageConfig),
    Committed(CommitName),
}

/// One tag of one engine image, classified.
#[derive(Debug, Clone)]
struct Entry {
    reference: String,
    origin: Origin,
    info: ImageInfo,
}

impl Entry {
    fn owner(&self) -> Option<&str> {
        match &self.origin {
            Origin::Base(_) => None,
            Origin::Committed(name) => Some(name.owner()),
        }
    }

    fn visible_to(&self, caller: &User) -> bool {
        self.owner().is_none_or(|owner| caller.can_act_for(owner))
    }

    fn matches(&self, reference: &str) -> bool {
        if self.reference == reference || self.info.id == reference {
            return true;
        }
        match &self.origin {
            Origin::Base(_) => {
                !reference.contains(':')
                    && self
                        .reference
                        .strip_prefix(reference)
                        .is_some_and(|rest| rest == ":latest")
            }
            Origin::Committed(name) => name.to_string() == reference,
        }
    }

    fn view(&self, caller: &User) -> ImageView {
        let (name, kind, comment) = match &self.origin {
            Origin::Base(config) => {
                let comment = if self.info.comment.is_empty() {
                    config.description.clone()
                } else {
                    self.info.comment.clone()
                };
                (self.reference.clone(), ImageKind::Base, comment)
            }
            Origin::Committed(name) => {
                let shown = if caller.is_admin {
                    self.reference.clone()
                } else {
                    name.to_string()
                };
                (shown, ImageKind::Committed, self.info.comment.clone())
            }
        };
        ImageView {
            name,
            image: self.reference.clone(),
            kind,
            owner: self.owner().map(str::to_string),
            id: self.info.id.clone(),
            comment,
            size: self.info.size,
            exposed_ports: self.info.exposed_ports.clone(),
            created: self.info.created,
        }
    }
}

/// Image registry view.
pub struct ImageRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    repository: String,
    base: Vec<ImageConfig>,
    commit_ports: Vec<u16>,
    policy: ImageSourcePolicy,
    pending: Arc<PendingCommits>,
}

impl std::fmt::Debug for ImageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRegistry")
            .field("runtime", &self.runtime.name())
            .field("repository", &self.repository)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ImageRegistry {
    /// Creates a view over `runtime` using the image settings of `config`.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &PodyConfig) -> Self {
        Self {
            runtime,
            repository: config.commit_name.clone(),
            base: config.images.clone(),
            commit_ports: config.commit_image_ports.clone(),
            policy: config.image_source_policy,
            pending: Arc::new(PendingCommits::default()),
        }
    }

    /// Repository committed images are tagged under.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Full reference for a commit of `owner` with an optional `tag`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed tag.
    pub fn commit_name(&self, owner: &str, tag: Option<&str>) -> Result<String> {
        Ok(CommitName::new(owner, tag)?.full(&self.repository))
    }

    fn classify(&self, reference: &str) -> Option<Origin> {
        if let Some(config) = self.base.iter().find(|c| c.admits(reference)) {
            return Some(Origin::Base(config.clone()));
        }
        CommitName::parse_full(&self.repository, reference).map(Origin::Committed)
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for info in self.runtime.list_images()? {
            for tag in &info.tags {
                if let Some(origin) = self.classify(tag) {
                    entries.push(Entry {
                        reference: tag.clone(),
                        origin,
                        info: info.clone(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(entries)
    }

    /// Finds `reference`, preferring the caller's own committed images when
    /// a short name is ambiguous.
    fn find(&self, caller: &User, reference: &str) -> Result<Entry> {
        let mut matches: Vec<Entry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.matches(reference))
            .collect();
        matches.sort_by_key(|e| !e.visible_to(caller));
        matches.into_iter().next().ok_or_else(|| PodyError::NotFound {
            kind: "image",
            id: reference.to_string(),
        })
    }

    /// Images visible to `caller`, sorted by reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot list images.
    pub fn list(&self, caller: &User) -> Result<Vec<ImageView>> {
        Ok(self
            .entries()?
            .iter()
            .filter(|e| e.visible_to(caller))
            .map(|e| e.view(caller))
            .collect())
    }

    /// Details of one visible image.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown images and for committed images of
    /// other users when the caller is not an admin.
    pub fn inspect(&self, caller: &User, reference: &str) -> Result<ImageView> {
        let entry = self.find(caller, reference)?;
        if !entry.visible_to(caller) {
            return Err(PodyError::NotFound {
                kind: "image",
                id: reference.to_string(),
            });
        }
        Ok(entry.view(caller))
    }

    /// Deletes a committed image.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for base images and for other users' images when
    /// the caller is not an admin; `NotFound` for unknown images.
    pub fn delete(&self, caller: &User, reference: &str) -> Result<()> {
        let entry = self.find(caller, reference)?;
        match entry.owner() {
            None => {
                return Err(PodyError::forbidden(format!(
                    "base image {} cannot be deleted",
                    entry.reference
                )));
            }
            Some(owner) if !caller.can_act_for(owner) => {
                return Err(PodyError::forbidden(format!(
                    "image {reference} belongs to another user"
                )));
            }
            Some(_) => {}
        }
        self.runtime.delete_image(&entry.reference)?;
        tracing::info!(image = %entry.reference, by = %caller.name, "committed image deleted");
        Ok(())
    }

    /// Resolves the image a pod of `owner` is created from.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the image is unknown or not admitted by the
    /// image-source policy.
    pub fn resolve_source(&self, owner: &User, reference: &str) -> Result<SourceImage> {
        let entry = self.find(owner, reference)?;
        match &entry.origin {
            Origin::Base(config) => Ok(SourceImage {
                image: entry.reference.clone(),
                ports: config.ports.clone(),
                kind: ImageKind::Base,
            }),
            Origin::Committed(name) => {
                let admitted = match self.policy {
                    ImageSourcePolicy::OwnerOnly => name.owner() == owner.name,
                    ImageSourcePolicy::AnyCommitted => true,
                };
                if !admitted {
                    return Err(PodyError::NotFound {
                        kind: "image",
                        id: reference.to_string(),
                    });
                }
                Ok(SourceImage {
                    image: entry.reference.clone(),
                    ports: self.commit_ports.clone(),
                    kind: ImageKind::Committed,
                })
            }
        }
    }

    /// Committed images of `owner`, excluding `replacing` (a tag about to
    /// be moved to a new image).
    fn owned(&self, owner: &str, replacing: Option<&str>) -> Result<Vec<Entry>> {
        let mut seen = BTreeSet::new();
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.owner() == Some(owner))
            .filter(|e| Some(e.reference.as_str()) != replacing)
            .filter(|e| seen.insert(e.info.id.clone()))
            .collect())
    }

    /// Checks the commit quotas of `owner` and holds a slot for a commit
    /// to `name`.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` when the committed image count or size is
    /// already at its limit.
    pub fn reserve_commit(&self, owner: &User, name: &CommitName) -> Result<CommitReservation> {
        let image = name.full(&self.repository);
        let existing = self.owned(&owner.name, Some(&image))?;
        let pending = self.pending.pending(&owner.name);

        let count = u64::try_from(existing.len() + pending + 1).unwrap_or(u64::MAX);
        if !owner.quota.commit_count.allows(count) {
            return Err(PodyError::quota(
                QuotaResource::ImageCount,
                format!(
                    "{} committed images (+{pending} pending), limit is {}",
                    existing.len(),
                    owner.quota.commit_count
                ),
            ));
        }

        let size: u64 = existing.iter().map(|e| e.info.size).sum();
        if let Limit::Limited(limit) = owner.quota.commit_size {
            if size >= limit {
                return Err(PodyError::quota(
                    QuotaResource::ImageSize,
                    format!("committed images use {size} bytes, limit is {limit}"),
                ));
            }
        }
        let staging = format!(
            "{}-staging:{}-{}",
            self.repository,
            owner.name,
            uuid::Uuid::new_v4().simple()
        );
        Ok(CommitReservation::acquire(&self.pending, &owner.name, image, staging))
    }

    /// Re-checks the size quota with the staged image in place of the one
    /// the final tag points at now. A fitting image gets the final tag; an
    /// oversized one is removed and the old image keeps its tag.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` when the staged image does not fit, or the
    /// engine error if the final tag cannot be moved.
    pub fn finish_commit(&self, reservation: CommitReservation, owner: &User, staged: &ImageInfo) -> Result<()> {
        let kept: u64 = self
            .owned(reservation.owner(), Some(reservation.image()))?
            .iter()
            .filter(|e| e.info.id != staged.id)
            .map(|e| e.info.size)
            .sum();
        let size = kept.saturating_add(staged.size);
        if !owner.quota.commit_size.allows(size) {
            tracing::warn!(
                image = %reservation.image(),
                size,
                limit = %owner.quota.commit_size,
                "committed image exceeds size quota, removing"
            );
            self.discard_staging(&reservation);
            return Err(PodyError::quota(
                QuotaResource::ImageSize,
                format!(
                    "committed images would use {size} bytes, limit is {}",
                    owner.quota.commit_size
                ),
            ));
        }
        if let Err(e) = self.runtime.tag(reservation.staging(), reservation.image()) {
            self.discard_staging(&reservation);
            return Err(e);
        }
        // The image keeps its final tag; this only drops the staging name.
        self.discard_staging(&reservation);
        tracing::info!(image = %reservation.image(), size, "commit tagged");
        Ok(())
    }

    fn discard_staging(&self, reservation: &CommitReservation) {
        if let Err(e) = self.runtime.delete_image(reservation.staging()) {
            tracing::error!(image = %reservation.staging(), error = %e, "failed to remove staging image");
        }
    }
}
