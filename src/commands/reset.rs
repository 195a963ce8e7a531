use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::CancelToken;
use crate::drivers::cluster::KindCluster;
use crate::drivers::workload::HelmWorkload;
use crate::reconcile::{Phase, Reconciler, report::ReportSink};

/// Reinstall the workload without touching the cluster
///
/// Uninstalls whatever is deployed (a no-op on an empty environment), then
/// installs and probes again. On an empty slate this behaves exactly like
/// `up`.
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
        let mut sink = ReportSink::open(machine);
        let cancel = CancelToken::new();

        let mut reconciler = Reconciler::new(&spec, &cluster, &workload, &mut sink);
        match reconciler.reset(&cancel) {
            Ok(outcome) if outcome.phase == Phase::Ready => {
                success!("workload {} is ready", spec.workload.release);
                Ok(ExitCode::SUCCESS)
            }
            Ok(_) => {
                error!("workload {} failed its health checks", spec.workload.release);
                Ok(ExitCode::FAILURE)
            }
            Err(error) => {
                critical!("{error} (final state: {:?})", reconciler.phase());
                Ok(if error.is_unreachable() {
                    ExitCode::from(2)
                } else {
                    ExitCode::FAILURE
                })
            }
        }
    }
}
