//! lemonade-server – entry point.
//!
//! Exit codes: 0 success, 1 runtime error, 2 usage error (clap parse
//! failures and malformed flag values such as a bad `--max-loaded-models`
//! arity).

use std::process::ExitCode;

use clap::Parser;
use lemonade_server::{cli, commands, serve};

fn main() -> ExitCode {
    let parsed = cli::Cli::parse();

    // Flag-value validation beyond clap's reach is still a usage error.
    let config = match parsed.global.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let result = match parsed.cmd {
        cli::Command::Serve => serve::run(config, parsed.global.log_file.clone(), None),
        cli::Command::Run { model } => {
            serve::run(config, parsed.global.log_file.clone(), Some(model))
        }
        cli::Command::List => commands::list(),
        cli::Command::Pull { model, register } => commands::pull(&model, register),
        cli::Command::Delete { model } => commands::delete(&model),
        cli::Command::Status => commands::status(),
        cli::Command::Stop => commands::stop(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
