use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::app;
use crate::config;
use crate::spec::load_profile;
use crate::util;

/// Inspect and adjust configuration
#[derive(Subcommand, Debug)]
pub enum Cli {
    Show(ShowCli),
    Path(PathCli),
    SetProfile(SetProfileCli),
}

impl Cli {
    pub fn exec(self, machine: bool) -> Result<ExitCode> {
        match self {
            Self::Show(cli) => cli.exec(machine),
            Self::Path(cli) => cli.exec(),
            Self::SetProfile(cli) => cli.exec(),
        }
    }
}

/// Print the fully resolved environment spec
#[derive(Args, Debug)]
#[command()]
pub struct ShowCli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,
}

impl ShowCli {
    pub fn exec(self, machine: bool) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), false)?;
        if machine {
            println!("{}", serde_json::to_string_pretty(&spec)?);
        } else {
            print!("{}", serde_yaml::to_string(&spec)?);
        }
        Ok(ExitCode::SUCCESS)
    }
}

/// Print the tool config file location
#[derive(Args, Debug)]
#[command()]
pub struct PathCli {}

impl PathCli {
    pub fn exec(self) -> Result<ExitCode> {
        let path = config::path()?;
        if util::exists(&path)? {
            println!("{}", path.display());
        } else {
            println!("{} (not created yet)", path.display());
        }
        Ok(ExitCode::SUCCESS)
    }
}

/// Set the profile used when none is passed on the command line
#[derive(Args, Debug)]
#[command()]
pub struct SetProfileCli {
    /// Profile name; must be built in or exist under the profiles directory
    name: String,
}

impl SetProfileCli {
    pub fn exec(self) -> Result<ExitCode> {
        // Reject names that would fail every later resolution.
        load_profile(&self.name)?;

        let mut updated = app::config().clone();
        updated.default_profile = Some(self.name.clone());
        config::save(updated)?;

        success!("default profile set to {}", self.name);
        Ok(ExitCode::SUCCESS)
    }
}
