//! `pody stat`: Aggregated CPU and GPU time.

use std::collections::BTreeMap;

use clap::{Args, Subcommand};

use super::{Context, Reported};
use crate::output;

/// Statistics subcommands.
#[derive(Subcommand, Debug)]
pub enum StatCommand {
    /// CPU seconds per user.
    Cputime(StatArgs),
    /// GPU seconds per user.
    Gputime(StatArgs),
}

/// Arguments shared by the `stat` subcommands.
#[derive(Args, Debug)]
pub struct StatArgs {
    /// Comma-separated users; defaults to the caller, or everyone for admins.
    #[arg(long, value_delimiter = ',')]
    pub users: Vec<String>,

    /// Only count samples newer than this span, e.g. `1d` or `2w`.
    #[arg(long)]
    pub since: Option<String>,
}

/// Executes a `stat` subcommand.
///
/// # Errors
///
/// Returns an error if authentication fails, the caller asks for other
/// users without admin rights, or the usage log cannot be read.
pub fn execute(ctx: &Context, cmd: StatCommand) -> anyhow::Result<()> {
    let caller = ctx.caller()?;
    let (args, totals) = match cmd {
        StatCommand::Cputime(args) => {
            let totals = ctx
                .service
                .cpu_time(&caller, selection(&args), args.since.as_deref())
                .reported(caller.is_admin)?;
            (args, totals)
        }
        StatCommand::Gputime(args) => {
            let totals = ctx
                .service
                .gpu_time(&caller, selection(&args), args.since.as_deref())
                .reported(caller.is_admin)?;
            (args, totals)
        }
    };
    tracing::debug!(users = totals.len(), since = ?args.since, "usage aggregated");
    print_totals(ctx, &totals)
}

fn selection(args: &StatArgs) -> Option<&[String]> {
    (!args.users.is_empty()).then_some(args.users.as_slice())
}

fn print_totals(ctx: &Context, totals: &BTreeMap<String, f64>) -> anyhow::Result<()> {
    if ctx.json {
        return output::print_json(totals);
    }
    let rows: Vec<Vec<String>> = totals
        .iter()
        .map(|(user, secs)| vec![user.clone(), format!("{secs:.1}"), output::format_seconds(*secs)])
        .collect();
    output::print_table(&["USER", "SECONDS", "TIME"], &rows);
    Ok(())
}
