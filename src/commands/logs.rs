use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::drivers::cluster::{ClusterDriver as _, KindCluster};
use crate::drivers::workload::{HelmWorkload, WorkloadDriver as _};

/// Print recent workload logs
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,

    /// Number of trailing lines per pod
    #[arg(long, default_value_t = 100)]
    lines: u32,
}

impl Cli {
    pub fn exec(self) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), false)?;
        let cluster = KindCluster::new();
        let workload = HelmWorkload::new();

        cluster.select_context(&spec.cluster.name)?;
        print!("{}", workload.logs(&spec, self.lines)?);
        Ok(ExitCode::SUCCESS)
    }
}
