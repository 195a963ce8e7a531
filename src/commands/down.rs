use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::drivers::cluster::KindCluster;
use crate::drivers::workload::HelmWorkload;
use crate::reconcile::{Reconciler, report::ReportSink};

/// Tear the environment down
///
/// Every teardown sub-step is attempted regardless of earlier failures;
/// failures are reported, not raised. Exits non-zero only when the
/// underlying tools cannot be run at all.
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,
}

/// Exit code for "the tools themselves are unreachable".
const EXIT_TOOLS_UNREACHABLE: u8 = 2;

impl Cli {
    pub fn exec(self, machine: bool) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), false)?;
        let cluster = KindCluster::new();
        let workload = HelmWorkload::new();
        let mut sink = ReportSink::open(machine);

        let summary = Reconciler::new(&spec, &cluster, &workload, &mut sink).down();

        for error in &summary.errors {
            warning!("teardown step {} failed: {}", error.step, error.detail);
        }
        if let Some(error) = &summary.destroy_error {
            warning!("cluster teardown failed: {error}");
        }

        if summary.tools_unreachable() {
            critical!("external tools are unreachable; nothing could be torn down");
            Ok(ExitCode::from(EXIT_TOOLS_UNREACHABLE))
        } else {
            success!("environment {} is down", spec.cluster.name);
            Ok(ExitCode::SUCCESS)
        }
    }
}
