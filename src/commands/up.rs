use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::CancelToken;
use crate::drivers::cluster::KindCluster;
use crate::drivers::workload::HelmWorkload;
use crate::reconcile::{Phase, Reconciler, report::ReportSink};

/// Bring the environment up: provision the cluster, install the workload,
/// and probe it
///
/// Exits zero only when every required health check passes. With
/// `--ephemeral` (or an ephemeral profile) the environment is torn down
/// again once probing concludes, whatever the outcome.
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,

    /// Tear the environment down once probing concludes
    #[arg(long)]
    ephemeral: bool,
}

impl Cli {
    pub fn exec(self, machine: bool) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), self.ephemeral)?;
        let cluster = KindCluster::new();
        let workload = HelmWorkload::new();
        let mut sink = ReportSink::open(machine);
        let cancel = CancelToken::new();

        let mut reconciler = Reconciler::new(&spec, &cluster, &workload, &mut sink);
        let (outcome, teardown) = reconciler.run(&cancel);
        let final_phase = reconciler.phase();
        debug!("{} step records written", sink.records().len());

        if let Some(summary) = &teardown {
            for error in &summary.errors {
                warning!("teardown step {} failed: {}", error.step, error.detail);
            }
        }

        match outcome {
            Ok(outcome) if outcome.phase == Phase::Ready => {
                success!("environment {} is ready", spec.cluster.name);
                Ok(ExitCode::SUCCESS)
            }
            Ok(_) => {
                error!("environment {} failed its health checks", spec.cluster.name);
                Ok(ExitCode::FAILURE)
            }
            Err(error) => {
                critical!("{error} (final state: {final_phase:?})");
                Ok(if error.is_unreachable() {
                    ExitCode::from(2)
                } else {
                    ExitCode::FAILURE
                })
            }
        }
    }
}
