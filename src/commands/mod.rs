mod completion;
mod config;
mod down;
mod exec;
mod logs;
mod reset;
mod status;
mod test;
mod up;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::app;
use crate::spec::{EnvironmentSpec, Resolver};

#[derive(Parser, Debug)]
#[command(
    name = "testbed",
    version,
    about = "Provision, verify, and tear down disposable local Kubernetes database environments"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Structured output: step records and snapshots as JSON on stdout
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Up(up::Cli),
    Down(down::Cli),
    Status(status::Cli),
    Test(test::Cli),
    Reset(reset::Cli),
    Logs(logs::Cli),
    Exec(exec::Cli),
    #[command(subcommand)]
    Config(config::Cli),
    Completion(completion::Cli),
}

impl Cli {
    pub fn exec(self) -> Result<ExitCode> {
        let machine = self.output == Some(OutputFormat::Json);
        match self.command {
            Commands::Up(cli) => cli.exec(machine),
            Commands::Down(cli) => cli.exec(machine),
            Commands::Status(cli) => cli.exec(machine),
            Commands::Test(cli) => cli.exec(machine),
            Commands::Reset(cli) => cli.exec(machine),
            Commands::Logs(cli) => cli.exec(),
            Commands::Exec(cli) => cli.exec(),
            Commands::Config(cli) => cli.exec(machine),
            Commands::Completion(cli) => cli.exec(),
        }
    }
}

/// Resolve the spec the way every subcommand does: named profile (or the
/// configured default), then the environment snapshot. This is the only
/// place process environment variables are read.
pub(crate) fn resolve_spec(profile: Option<&str>, ephemeral: bool) -> Result<EnvironmentSpec> {
    let profile = profile
        .map(str::to_string)
        .or_else(|| app::config().default_profile.clone());
    let spec = Resolver::new(profile, std::env::vars().collect())
        .ephemeral(ephemeral)
        .resolve()?;
    Ok(spec)
}
