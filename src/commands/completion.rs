use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, CommandFactory as _};
use clap_complete::Shell;

/// Generate a shell completion script
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

impl Cli {
    pub fn exec(self) -> Result<ExitCode> {
        let mut command = super::Cli::command();
        clap_complete::generate(self.shell, &mut command, "testbed", &mut io::stdout());
        Ok(ExitCode::SUCCESS)
    }
}
