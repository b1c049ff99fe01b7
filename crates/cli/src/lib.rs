pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use crate::commands::request::RequestArgs;

#[derive(Debug, Parser)]
#[command(
    name = "procura",
    about = "Procura operator CLI",
    long_about = "Operate the Procura approval backend: migrations, demo directory, config inspection, readiness checks, and request actions against a running server.",
    after_help = "Examples:\n  procura doctor --json\n  procura seed\n  procura request --as 6 create --title Monitors --cost 900 --item monitor:3:300\n  procura request --as 3 pending\n  procura request --as 4 select-quote 12 --lowest"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo user directory and verify it")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, and backend reachability")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Act on approval requests through the configured backend")]
    Request(RequestArgs),
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Request(args) => commands::request::run(args),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
