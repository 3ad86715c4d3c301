use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::EnvFilter;

mod args;
mod backup;
mod config;
mod env;
mod error;
mod paginate;
mod remote;
mod restore;
mod rules;
mod session;
mod store;
mod tree;
mod ui;
mod utils;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("FIREBAK_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "firebak",
    about = "Sharded backup and restore for Firebase Realtime Database",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export annotated collections and the security rules to a backup directory
    Backup(CLIArgs<backup::BackupArgs>),
    /// Replay a backup directory into the database
    Restore(CLIArgs<restore::RestoreArgs>),
}

impl Commands {
    fn verbose(&self) -> bool {
        match self {
            Commands::Backup(cmd) => cmd.base.verbose,
            Commands::Restore(cmd) => cmd.base.verbose,
        }
    }
}

fn setup_logging(verbose: bool) {
    let default_filter = if verbose {
        "firebak=debug,warn"
    } else {
        "firebak=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    setup_logging(cli.command.verbose());

    match cli.command {
        Commands::Backup(cmd) => backup::run(cmd.base, cmd.args).await?,
        Commands::Restore(cmd) => restore::run(cmd.base, cmd.args).await?,
    }

    Ok(())
}
