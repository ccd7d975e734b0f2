//! `pody user`: Accounts, passwords, and quotas.

use clap::{Args, Subcommand};
use pody_common::quota::{Limit, Quota, QuotaUpdate};
use pody_common::size::parse_size;
use pody_common::user::User;
use pody_core::identity::UserListing;
use pody_core::service::UserUsage;

use super::{Context, Reported};
use crate::output;

/// User subcommands.
#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// Show a user's role and quota.
    Info(NameArgs),
    /// Show a user's quota next to current holdings.
    Usage(NameArgs),
    /// List users.
    List,
    /// Change a password.
    Passwd(PasswdArgs),
    /// Provision a user (admins only).
    Add(AddArgs),
    /// Change a user's role or quota (admins only).
    Update(UpdateArgs),
    /// Create or update a user directly in the local data directory.
    Bootstrap(BootstrapArgs),
}

/// Optional user name; defaults to the caller.
#[derive(Args, Debug)]
pub struct NameArgs {
    /// Username.
    #[arg(long)]
    pub user: Option<String>,
}

/// Arguments for `user passwd`.
#[derive(Args, Debug)]
pub struct PasswdArgs {
    /// New password.
    pub new_password: String,

    /// Whose password to change (admins only for other users).
    #[arg(long)]
    pub user: Option<String>,
}

/// Quota flags. Values accept sizes (`8g`) or `unlimited`/`-1`.
#[derive(Args, Debug, Default)]
pub struct QuotaArgs {
    /// Maximum number of pods.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub max_pods: Option<Limit>,
    /// Maximum GPU devices across all pods.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub gpu_count: Option<Limit>,
    /// Per-pod memory cap.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub memory_limit: Option<Limit>,
    /// Per-pod storage cap.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub storage_size: Option<Limit>,
    /// Per-pod shared-memory cap.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub shm_size: Option<Limit>,
    /// Maximum committed images.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub commit_count: Option<Limit>,
    /// Maximum total size of committed images.
    #[arg(long, value_parser = parse_limit, allow_hyphen_values = true)]
    pub commit_size: Option<Limit>,
}

impl QuotaArgs {
    const fn update(&self) -> QuotaUpdate {
        QuotaUpdate {
            max_pods: self.max_pods,
            gpu_count: self.gpu_count,
            memory_limit: self.memory_limit,
            storage_size: self.storage_size,
            shm_size: self.shm_size,
            commit_count: self.commit_count,
            commit_size: self.commit_size,
        }
    }
}

/// Arguments for `user add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Username (3-20 alphanumeric characters).
    pub name: String,

    /// Initial password.
    #[arg(long = "new-password")]
    pub new_password: String,

    /// Grant admin rights.
    #[arg(long)]
    pub admin: bool,

    /// Quota overrides on top of the configured default.
    #[command(flatten)]
    pub quota: QuotaArgs,
}

/// Arguments for `user update`.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Username.
    pub name: String,

    /// Set or clear admin rights.
    #[arg(long)]
    pub admin: Option<bool>,

    /// Quota fields to change.
    #[command(flatten)]
    pub quota: QuotaArgs,
}

/// Arguments for `user bootstrap`.
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Username.
    pub name: String,

    /// Password; required when the user does not exist yet.
    #[arg(long = "new-password")]
    pub new_password: Option<String>,

    /// Set or clear admin rights.
    #[arg(long)]
    pub admin: Option<bool>,

    /// Quota fields to change.
    #[command(flatten)]
    pub quota: QuotaArgs,
}

/// Parses a quota value: a size, a count, or `unlimited`/`-1`.
///
/// # Errors
///
/// Returns `InvalidInput` for malformed values.
pub fn parse_limit(s: &str) -> pody_common::error::Result<Limit> {
    match s.trim() {
        "unlimited" | "-1" => Ok(Limit::Unlimited),
        other => parse_size(other).map(Limit::Limited),
    }
}

/// Executes a `user` subcommand.
///
/// # Errors
///
/// Returns an error if authentication or the operation fails.
pub fn execute(ctx: &Context, cmd: UserCommand) -> anyhow::Result<()> {
    let svc = &ctx.service;
    if let UserCommand::Bootstrap(args) = cmd {
        let user = svc
            .bootstrap_user(
                &args.name,
                args.new_password.as_deref(),
                args.admin,
                &args.quota.update(),
            )
            .reported(true)?;
        tracing::info!(user = %user.name, admin = user.is_admin, "user bootstrapped");
        return print_user(ctx, &user);
    }

    let caller = ctx.caller()?;
    let admin = caller.is_admin;
    match cmd {
        UserCommand::Info(args) => {
            let user = svc.user_info(&caller, args.user.as_deref()).reported(admin)?;
            print_user(ctx, &user)
        }
        UserCommand::Usage(args) => {
            let usage = svc.user_usage(&caller, args.user.as_deref()).reported(admin)?;
            print_usage(ctx, &usage)
        }
        UserCommand::List => {
            let listing = svc.list_users(&caller);
            if ctx.json {
                return output::print_json(&listing);
            }
            match listing {
                UserListing::Detailed(users) => {
                    let rows: Vec<Vec<String>> = users
                        .into_iter()
                        .map(|u| vec![u.name, if u.is_admin { "admin" } else { "user" }.into()])
                        .collect();
                    output::print_table(&["NAME", "ROLE"], &rows);
                }
                UserListing::Names(names) => {
                    for name in names {
                        println!("{name}");
                    }
                }
            }
            Ok(())
        }
        UserCommand::Passwd(args) => {
            svc.set_password(&caller, args.user.as_deref(), &args.new_password)
                .reported(admin)?;
            println!("password updated");
            Ok(())
        }
        UserCommand::Add(args) => {
            let update = args.quota.update();
            let quota = (update != QuotaUpdate::default()).then(|| {
                let mut quota = svc.config().default_quota;
                update.apply(&mut quota);
                quota
            });
            let user = svc
                .add_user(&caller, &args.name, &args.new_password, args.admin, quota)
                .reported(admin)?;
            print_user(ctx, &user)
        }
        UserCommand::Update(args) => {
            let user = svc
                .update_user(&caller, &args.name, args.admin, &args.quota.update())
                .reported(admin)?;
            print_user(ctx, &user)
        }
        UserCommand::Bootstrap(_) => Ok(()),
    }
}

fn quota_rows(quota: &Quota) -> Vec<Vec<String>> {
    vec![
        vec!["max_pods".into(), quota.max_pods.to_string()],
        vec!["gpu_count".into(), quota.gpu_count.to_string()],
        vec!["memory_limit".into(), output::format_byte_limit(quota.memory_limit)],
        vec!["storage_size".into(), output::format_byte_limit(quota.storage_size)],
        vec!["shm_size".into(), output::format_byte_limit(quota.shm_size)],
        vec!["commit_count".into(), quota.commit_count.to_string()],
        vec!["commit_size".into(), output::format_byte_limit(quota.commit_size)],
    ]
}

fn print_user(ctx: &Context, user: &User) -> anyhow::Result<()> {
    if ctx.json {
        return output::print_json(user);
    }
    let mut rows = vec![
        vec!["name".into(), user.name.clone()],
        vec!["admin".into(), user.is_admin.to_string()],
    ];
    rows.extend(quota_rows(&user.quota));
    output::print_table(&["FIELD", "VALUE"], &rows);
    Ok(())
}

fn print_usage(ctx: &Context, usage: &UserUsage) -> anyhow::Result<()> {
    if ctx.json {
        return output::print_json(usage);
    }
    let gpus: Vec<String> = usage.usage.gpu_ids_in_use.iter().map(ToString::to_string).collect();
    let rows = vec![
        vec!["pods".into(), usage.usage.pod_count.to_string(), usage.quota.max_pods.to_string()],
        vec![
            "gpus".into(),
            format!("{} [{}]", usage.usage.gpu_ids_in_use.len(), gpus.join(",")),
            usage.quota.gpu_count.to_string(),
        ],
        vec![
            "memory".into(),
            output::format_byte_limit(usage.usage.memory_reserved),
            format!("{} per pod", output::format_byte_limit(usage.quota.memory_limit)),
        ],
    ];
    println!("user {}", usage.user);
    output::print_table(&["RESOURCE", "IN USE", "QUOTA"], &rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_accept_sizes_counts_and_unlimited() {
        assert_eq!(parse_limit("3").unwrap(), Limit::Limited(3));
        assert_eq!(parse_limit("8g").unwrap(), Limit::Limited(8 * 1024 * 1024 * 1024));
        assert_eq!(parse_limit("-1").unwrap(), Limit::Unlimited);
        assert_eq!(parse_limit("unlimited").unwrap(), Limit::Unlimited);
        assert!(parse_limit("lots").is_err());
    }

    #[test]
    fn empty_quota_flags_change_nothing() {
        assert_eq!(QuotaArgs::default().update(), QuotaUpdate::default());
    }
}
