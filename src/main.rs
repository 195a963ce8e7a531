#[macro_use]
mod macros;

mod app;
mod commands;
mod config;
mod drivers;
mod health;
mod platform;
mod reconcile;
mod spec;
mod util;

use std::process::ExitCode;

use clap::Parser;
use commands::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();

    app::set_global_verbosity(cli.verbose.log_level_filter());

    match config::load() {
        Ok(config) => app::set_global_config(config),
        Err(error) => {
            critical!("{error:#}");
            return ExitCode::FAILURE;
        }
    }

    match cli.exec() {
        Ok(code) => code,
        Err(error) => {
            critical!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
