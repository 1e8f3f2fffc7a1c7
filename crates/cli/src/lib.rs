pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "ichigo",
    about = "Ichigo operator CLI",
    long_about = "Check readiness, apply migrations, inspect configuration and tidy the \
                  conversation store of an Ichigo relay. The relay itself runs as `ichigod`.",
    after_help = "Examples:\n  ichigo doctor --json\n  ichigo config\n  ichigo tidy"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run startup preflight checks and return structured status output")]
    Start,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, bot token, provider keys and database readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Delete stored conversations that are no longer allow-listed")]
    Tidy,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => commands::start::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Tidy => commands::tidy::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
