//! `pody pod`: Create, run, and commit pods.

use std::time::Duration;

use clap::{Args, Subcommand};
use pody_common::size::{parse_size, parse_span};
use pody_core::ledger::Pod;
use pody_core::lifecycle::PodRequest;

use super::{Context, Reported};
use crate::output;

/// Pod subcommands.
#[derive(Subcommand, Debug)]
pub enum PodCommand {
    /// Create a pod from an image (it is not started).
    Create(CreateArgs),
    /// Stop and remove a pod, releasing its GPUs and ports.
    Delete(TargetArgs),
    /// Start a created or stopped pod.
    Start(TargetArgs),
    /// Stop a running pod.
    Stop(TargetArgs),
    /// Stop (if running) and start a pod.
    Restart(TargetArgs),
    /// Show a pod's status and allocations.
    Inspect(TargetArgs),
    /// List pod names.
    List(ListArgs),
    /// Run a shell command inside a running pod.
    Exec(ExecArgs),
    /// Save a pod's filesystem as a private image.
    Commit(CommitArgs),
}

/// A pod reference: an instance tag, or `<user>-<tag>` for admins.
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Instance tag or full pod name.
    pub ins: String,
}

/// Arguments for `pod create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Instance tag or full pod name.
    pub ins: String,

    /// Base or committed image.
    pub image: String,

    /// Number of GPU devices.
    #[arg(long, default_value_t = 0)]
    pub gpus: u32,

    /// Memory limit, e.g. `8g`; defaults to the quota cap.
    #[arg(long, value_parser = parse_size)]
    pub memory: Option<u64>,

    /// Shared-memory size, e.g. `1g`; defaults to the quota cap.
    #[arg(long, value_parser = parse_size)]
    pub shm: Option<u64>,

    /// Writable storage, e.g. `50g`; defaults to the quota cap.
    #[arg(long, value_parser = parse_size)]
    pub storage: Option<u64>,
}

/// Arguments for `pod list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Whose pods to list (admins only for other users).
    #[arg(long)]
    pub user: Option<String>,
}

/// Arguments for `pod exec`.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Instance tag or full pod name.
    pub ins: String,

    /// Give up after this span, e.g. `30s` or `5m`.
    #[arg(long, value_parser = parse_span)]
    pub timeout: Option<Duration>,

    /// Command line, run with `/bin/bash -c`.
    #[arg(trailing_var_arg = true, required = true)]
    pub cmd: Vec<String>,
}

/// Arguments for `pod commit`.
#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Instance tag or full pod name.
    pub ins: String,

    /// Image tag; defaults to the instance tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Commit message.
    #[arg(long)]
    pub msg: Option<String>,
}

/// Executes a `pod` subcommand.
///
/// # Errors
///
/// Returns an error if authentication or the operation fails.
pub fn execute(ctx: &Context, cmd: PodCommand) -> anyhow::Result<()> {
    let caller = ctx.caller()?;
    let svc = &ctx.service;
    let admin = caller.is_admin;
    match cmd {
        PodCommand::Create(args) => {
            let request = PodRequest {
                gpus: args.gpus,
                memory: args.memory,
                shm: args.shm,
                storage: args.storage,
            };
            let pod = svc
                .create_pod(&caller, &args.ins, &args.image, &request)
                .reported(admin)?;
            tracing::info!(pod = %pod.name, "pod created");
            print_pod(ctx, &pod)
        }
        PodCommand::Delete(args) => {
            let log = svc.delete_pod(&caller, &args.ins).reported(admin)?;
            print_log(ctx, &log)
        }
        PodCommand::Start(args) => {
            let log = svc.start_pod(&caller, &args.ins).reported(admin)?;
            print_log(ctx, &log)
        }
        PodCommand::Stop(args) => {
            svc.stop_pod(&caller, &args.ins).reported(admin)?;
            print_log(ctx, &format!("pod {} stopped", args.ins))
        }
        PodCommand::Restart(args) => {
            let log = svc.restart_pod(&caller, &args.ins).reported(admin)?;
            print_log(ctx, &log)
        }
        PodCommand::Inspect(args) => {
            let pod = svc.inspect_pod(&caller, &args.ins).reported(admin)?;
            print_pod(ctx, &pod)
        }
        PodCommand::List(args) => {
            let names = svc.list_pods(&caller, args.user.as_deref()).reported(admin)?;
            if ctx.json {
                return output::print_json(&names);
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        PodCommand::Exec(args) => {
            let command = args.cmd.join(" ");
            let result = svc
                .exec_pod(&caller, &args.ins, &command, args.timeout)
                .reported(admin)?;
            if ctx.json {
                output::print_json(&result)?;
            } else {
                print!("{}", result.log);
            }
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
            Ok(())
        }
        PodCommand::Commit(args) => {
            let result = svc
                .commit_pod(&caller, &args.ins, args.tag.as_deref(), args.msg.as_deref())
                .reported(admin)?;
            if ctx.json {
                return output::print_json(&result);
            }
            println!("{}", result.image_name);
            Ok(())
        }
    }
}

fn print_log(ctx: &Context, log: &str) -> anyhow::Result<()> {
    if ctx.json {
        return output::print_json(&serde_json::json!({ "log": log }));
    }
    println!("{log}");
    Ok(())
}

fn print_pod(ctx: &Context, pod: &Pod) -> anyhow::Result<()> {
    if ctx.json {
        return output::print_json(pod);
    }
    let ports: Vec<String> = pod.port_mapping.iter().map(ToString::to_string).collect();
    let gpus: Vec<String> = pod.gpu_ids.iter().map(ToString::to_string).collect();
    let rows = vec![
        vec!["name".into(), pod.name.clone()],
        vec!["owner".into(), pod.owner.clone()],
        vec!["status".into(), pod.status.to_string()],
        vec!["image".into(), pod.image.clone()],
        vec!["container".into(), pod.container_id.to_string()],
        vec!["ports".into(), ports.join(", ")],
        vec!["gpus".into(), gpus.join(", ")],
        vec!["memory".into(), output::format_byte_limit(pod.memory_limit)],
        vec!["shm".into(), output::format_byte_limit(pod.shm_size)],
        vec!["storage".into(), output::format_byte_limit(pod.storage_size)],
        vec!["created".into(), pod.created_at.to_rfc3339()],
    ];
    output::print_table(&["FIELD", "VALUE"], &rows);
    Ok(())
}
