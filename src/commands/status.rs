use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::drivers::cluster::{ClusterDriver as _, KindCluster};
use crate::drivers::workload::{HelmWorkload, WorkloadDriver as _};

/// Show a live snapshot of the environment
///
/// The snapshot is always taken from the running tools, never cached. The
/// exit code reflects workload readiness.
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,
}

impl Cli {
    pub fn exec(self, machine: bool) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), false)?;
        let cluster = KindCluster::new();
        let workload = HelmWorkload::new();

        cluster.select_context(&spec.cluster.name)?;
        let status = workload.status(&spec)?;

        if machine {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            display!("cluster:   {}", spec.cluster.name);
            display!("namespace: {}", spec.workload.namespace);
            display!("release:   {}", spec.workload.release);
            display!("status:    {status}");
            for pod in &status.pods {
                display!(
                    "  pod {} [{}] {}",
                    pod.name,
                    pod.phase,
                    if pod.ready { "ready" } else { "not ready" }
                );
            }
        }

        Ok(if status.ready() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}
