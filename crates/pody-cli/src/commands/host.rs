//! `pody host`: Host versions and GPU processes.

use clap::{Args, Subcommand};
use pody_common::size::format_bytes;

use super::{Context, Reported};
use crate::output;

/// Host subcommands.
#[derive(Subcommand, Debug)]
pub enum HostCommand {
    /// Versions of pody, the container engine, and the GPU stack.
    Spec,
    /// Processes running on GPU devices.
    GpuPs(GpuPsArgs),
}

/// Arguments for `host gpu-ps`.
#[derive(Args, Debug)]
pub struct GpuPsArgs {
    /// Comma-separated device ids; defaults to every pooled GPU.
    #[arg(long, value_delimiter = ',')]
    pub id: Vec<u32>,
}

/// Executes a `host` subcommand.
///
/// # Errors
///
/// Returns an error if authentication or the query fails.
pub fn execute(ctx: &Context, cmd: HostCommand) -> anyhow::Result<()> {
    let caller = ctx.caller()?;
    match cmd {
        HostCommand::Spec => {
            let spec = ctx.service.host_spec();
            if ctx.json {
                return output::print_json(&spec);
            }
            let unknown = || "unknown".to_string();
            let rows = vec![
                vec!["pody".into(), spec.pody_version.to_string()],
                vec!["runtime".into(), spec.runtime_version.unwrap_or_else(unknown)],
                vec!["driver".into(), spec.driver_version.unwrap_or_else(unknown)],
                vec!["toolkit".into(), spec.toolkit_version.unwrap_or_else(unknown)],
            ];
            output::print_table(&["COMPONENT", "VERSION"], &rows);
            Ok(())
        }
        HostCommand::GpuPs(args) => {
            let ids = (!args.id.is_empty()).then_some(args.id.as_slice());
            let by_gpu = ctx.service.gpu_processes(ids).reported(caller.is_admin)?;
            if ctx.json {
                return output::print_json(&by_gpu);
            }
            let mut rows = Vec::new();
            for (gpu, procs) in &by_gpu {
                for p in procs {
                    rows.push(vec![
                        gpu.to_string(),
                        p.pid.to_string(),
                        p.pod.clone().unwrap_or_else(|| "-".into()),
                        format_bytes(p.gpu_memory_used),
                        format_bytes(p.memory_used),
                        output::format_seconds(p.uptime),
                        p.cmd.clone(),
                    ]);
                }
            }
            output::print_table(&["GPU", "PID", "POD", "GPU MEM", "MEM", "UPTIME", "COMMAND"], &rows);
            Ok(())
        }
    }
}
