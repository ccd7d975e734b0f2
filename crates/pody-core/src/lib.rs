//! # pody-core
//!
//! Orchestration core of the Pody service: identities and quotas, the
//! resource ledger, pod lifecycle, usage aggregation, and the typed
//! service facade the outer shell calls into.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod help;
pub mod host;
pub mod identity;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod service;
pub mod state;
pub mod usage;
