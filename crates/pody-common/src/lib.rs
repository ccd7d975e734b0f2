//! # pody-common
//!
//! Shared types, the error taxonomy, the quota model, configuration, and
//! constants used across the entire Pody workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod quota;
pub mod size;
pub mod types;
pub mod user;
