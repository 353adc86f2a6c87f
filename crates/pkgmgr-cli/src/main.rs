use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pkgmgr_core::{UserId, UserTarget, SYSTEM_USER};

mod completion;
mod dispatch;
mod render;

use completion::CliCompletionShell;
use dispatch::run_cli;

#[derive(Parser, Debug)]
#[command(name = "pkgmgr")]
#[command(about = "Multi-user application package manager", long_about = None)]
struct Cli {
    /// Device root holding the registry, app code and app data.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rebuild the registry from the factory image and app directories.
    BootScan,
    Install {
        archive: PathBuf,
        #[command(flatten)]
        options: InstallArgs,
    },
    /// Install a directory prepared by an install session.
    InstallStaged {
        name: String,
        dir: PathBuf,
        #[command(flatten)]
        options: InstallArgs,
    },
    Uninstall {
        name: String,
        #[arg(long, default_value = "all", value_parser = parse_user_target)]
        user: UserTarget,
        #[arg(long, short = 'k')]
        keep_data: bool,
        #[arg(long)]
        dont_kill: bool,
    },
    Move {
        name: String,
        /// `internal`, `external` or `volume:<uuid>`.
        location: String,
    },
    List {
        #[arg(long, default_value_t = SYSTEM_USER)]
        user: UserId,
    },
    Info {
        name: String,
        #[arg(long, default_value_t = SYSTEM_USER)]
        user: UserId,
    },
    Grant {
        name: String,
        permission: String,
        #[arg(long, default_value_t = SYSTEM_USER)]
        user: UserId,
    },
    Revoke {
        name: String,
        permission: String,
        #[arg(long, default_value_t = SYSTEM_USER)]
        user: UserId,
    },
    ClearData {
        name: String,
        #[arg(long, default_value_t = SYSTEM_USER)]
        user: UserId,
    },
    CreateUser {
        id: UserId,
    },
    RemoveUser {
        id: UserId,
    },
    /// Print a shell completion script; the shell defaults to `$SHELL`.
    Completion {
        #[arg(value_enum)]
        shell: Option<CliCompletionShell>,
    },
}

#[derive(Args, Debug, Clone)]
struct InstallArgs {
    #[arg(long, short = 'r')]
    replace: bool,
    #[arg(long, short = 'd')]
    downgrade: bool,
    #[arg(long, short = 't')]
    test: bool,
    #[arg(long, conflicts_with = "external")]
    internal: bool,
    #[arg(long)]
    external: bool,
    #[arg(long, conflicts_with_all = ["internal", "external"])]
    volume: Option<String>,
    #[arg(long)]
    forward_locked: bool,
    #[arg(long, short = 'g')]
    grant_runtime: bool,
    #[arg(long)]
    dont_kill: bool,
    /// Package name recorded as the installer of record.
    #[arg(long)]
    installer: Option<String>,
    #[arg(long, default_value = "all", value_parser = parse_user_target)]
    user: UserTarget,
}

fn parse_user_target(value: &str) -> Result<UserTarget, String> {
    UserTarget::parse(value).ok_or_else(|| format!("expected a user id or 'all', got '{value}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run_cli(cli).await
}

#[cfg(test)]
mod tests;
