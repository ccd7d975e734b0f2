//! Adapters for the external collaborators of the Pody lifecycle manager:
//! the container engine, the GPU device driver, and the host process table.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod devices;
pub mod exec;
pub mod process;
