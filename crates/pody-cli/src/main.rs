//! # pody: multi-tenant pod manager CLI
//!
//! Creates, runs, and accounts for per-user containers on a shared GPU
//! host. Every command authenticates as `--username`/`--password`
//! (or `PODY_USERNAME`/`PODY_PASSWORD`) except `user bootstrap` and
//! `daemon`, which operate on the local data directory directly.

#![allow(clippy::print_stdout)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    commands::execute(cli)
}
