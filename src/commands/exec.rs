use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::CancelToken;
use crate::drivers::cluster::{ClusterDriver as _, KindCluster};
use crate::drivers::workload::{HelmWorkload, WorkloadDriver as _};

/// Run one query-shell statement inside the workload pod
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,

    /// The statement to execute
    statement: String,
}

impl Cli {
    pub fn exec(self) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), false)?;
        let cluster = KindCluster::new();
        let workload = HelmWorkload::new();

        cluster.select_context(&spec.cluster.name)?;
        let result = workload.exec(
            &spec,
            &self.statement,
            spec.check_timeout(),
            &CancelToken::new(),
        )?;

        print!("{}", result.stdout);
        if result.success {
            Ok(ExitCode::SUCCESS)
        } else {
            critical!("{}", result.stderr.trim_end());
            Ok(ExitCode::FAILURE)
        }
    }
}
