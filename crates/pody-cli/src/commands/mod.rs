//! CLI command definitions and dispatch.

pub mod daemon;
pub mod host;
pub mod image;
pub mod pod;
pub mod stat;
pub mod user;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pody_common::config::PodyConfig;
use pody_common::constants;
use pody_common::error::Result as PodyResult;
use pody_common::user::User;
use pody_core::identity::Credentials;
use pody_core::service::PodyService;

use crate::output;

/// Pody: multi-tenant container lifecycle manager.
#[derive(Parser, Debug)]
#[command(name = "pody", version, about, long_about = None, disable_help_subcommand = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding config, users, ledger, and usage log.
    #[arg(long, global = true, env = constants::HOME_ENV)]
    pub home: Option<PathBuf>,

    /// Username to act as.
    #[arg(short, long, global = true, env = "PODY_USERNAME")]
    pub username: Option<String>,

    /// Password for `--username`.
    #[arg(short, long, global = true, env = "PODY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, run, and commit pods.
    #[command(subcommand)]
    Pod(pod::PodCommand),
    /// Browse and delete images.
    #[command(subcommand)]
    Image(image::ImageCommand),
    /// Accounts, passwords, and quotas.
    #[command(subcommand)]
    User(user::UserCommand),
    /// Aggregated CPU and GPU time.
    #[command(subcommand)]
    Stat(stat::StatCommand),
    /// Host versions and GPU processes.
    #[command(subcommand)]
    Host(host::HostCommand),
    /// List operations and their parameters.
    Help(HelpArgs),
    /// Print the service version.
    Version,
    /// Reconcile pod status and sample usage until interrupted.
    Daemon(daemon::DaemonArgs),
}

/// Arguments for the `help` command.
#[derive(Args, Debug)]
pub struct HelpArgs {
    /// Operation path prefix, e.g. `/pod`.
    #[arg(default_value = "/")]
    pub path: String,
}

/// Everything a command handler needs.
pub struct Context {
    /// The opened service.
    pub service: PodyService,
    /// Print JSON instead of tables.
    pub json: bool,
    credentials: Option<Credentials>,
}

impl Context {
    /// Authenticates the configured credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if no credentials were given or they are rejected.
    pub fn caller(&self) -> anyhow::Result<User> {
        let Some(credentials) = &self.credentials else {
            anyhow::bail!("credentials required: pass --username/--password or set PODY_USERNAME/PODY_PASSWORD");
        };
        self.service.authenticate(credentials).reported(false)
    }
}

/// Converts service errors into CLI errors, hiding internal details from
/// non-admins.
pub trait Reported<T> {
    /// Maps the error through [`pody_common::error::PodyError::report`].
    ///
    /// # Errors
    ///
    /// Returns the reported error.
    fn reported(self, is_admin: bool) -> anyhow::Result<T>;
}

impl<T> Reported<T> for PodyResult<T> {
    fn reported(self, is_admin: bool) -> anyhow::Result<T> {
        self.map_err(|e| {
            tracing::debug!(error = ?e, "request failed");
            anyhow::anyhow!(output::error_line(&e.report(is_admin)))
        })
    }
}

/// Opens the service on the selected data directory.
///
/// # Errors
///
/// Returns an error if the configuration or state files cannot be loaded.
pub fn open_service(home: Option<PathBuf>) -> anyhow::Result<PodyService> {
    let home = home.unwrap_or_else(|| constants::data_dir().clone());
    let config = PodyConfig::load_or_init(&home).reported(true)?;
    tracing::debug!(home = %home.display(), "opening service");
    PodyService::open(config).reported(true)
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let credentials = match (cli.username, cli.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        _ => None,
    };
    let ctx = Context {
        service: open_service(cli.home)?,
        json: cli.json,
        credentials,
    };
    match cli.command {
        Command::Pod(cmd) => pod::execute(&ctx, cmd),
        Command::Image(cmd) => image::execute(&ctx, cmd),
        Command::User(cmd) => user::execute(&ctx, cmd),
        Command::Stat(cmd) => stat::execute(&ctx, cmd),
        Command::Host(cmd) => host::execute(&ctx, cmd),
        Command::Help(args) => {
            let routes = ctx.service.help(&args.path).reported(false)?;
            if ctx.json {
                return output::print_json(&routes);
            }
            let rows = routes
                .iter()
                .map(|r| {
                    let params: Vec<String> = r
                        .params
                        .iter()
                        .map(|p| if p.optional { format!("[{}]", p.name) } else { p.name.to_string() })
                        .collect();
                    vec![r.path.to_string(), r.methods.join(","), params.join(" ")]
                })
                .collect::<Vec<_>>();
            output::print_table(&["PATH", "METHODS", "PARAMS"], &rows);
            Ok(())
        }
        Command::Version => {
            let version = ctx.service.version();
            if ctx.json {
                return output::print_json(&version);
            }
            println!("pody {version}");
            Ok(())
        }
        Command::Daemon(args) => daemon::execute(ctx, &args),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_create_with_sizes() {
        let cli = Cli::try_parse_from([
            "pody", "-u", "alice", "-p", "secret", "pod", "create", "dev", "base:1", "--gpus", "2",
            "--memory", "8g",
        ])
        .unwrap();
        assert_eq!(cli.username.as_deref(), Some("alice"));
        let Command::Pod(pod::PodCommand::Create(args)) = cli.command else {
            panic!("expected pod create");
        };
        assert_eq!(args.gpus, 2);
        assert_eq!(args.memory, Some(8 * 1024 * 1024 * 1024));
        assert_eq!(args.shm, None);
    }

    #[test]
    fn exec_keeps_trailing_command() {
        let cli = Cli::try_parse_from(["pody", "pod", "exec", "dev", "--timeout", "5m", "ls", "-la", "/"])
            .unwrap();
        let Command::Pod(pod::PodCommand::Exec(args)) = cli.command else {
            panic!("expected pod exec");
        };
        assert_eq!(args.timeout, Some(std::time::Duration::from_secs(300)));
        assert_eq!(args.cmd.join(" "), "ls -la /");
    }

    #[test]
    fn stat_users_are_comma_separated() {
        let cli = Cli::try_parse_from(["pody", "stat", "gputime", "--users", "alice,bob", "--since", "1d"])
            .unwrap();
        let Command::Stat(stat::StatCommand::Gputime(args)) = cli.command else {
            panic!("expected stat gputime");
        };
        assert_eq!(args.users, ["alice", "bob"]);
        assert_eq!(args.since.as_deref(), Some("1d"));
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(Cli::try_parse_from(["pody", "pod", "create", "dev", "base:1", "--memory", "8q"]).is_err());
    }
}
