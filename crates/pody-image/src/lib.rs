//! # pody-image
//!
//! Image registry view for the Pody lifecycle manager.
//!
//! Handles:
//! - **Naming**: committed images live under `<commit_name>:<user>[-<tag>]`.
//! - **Registry**: per-caller listing, inspection, deletion policy, and
//!   image-source resolution for pod creation.
//! - **Reservations**: provisional commit-quota accounting.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod naming;
pub mod registry;
pub mod reservation;
