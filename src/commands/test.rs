use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::CancelToken;
use crate::drivers::cluster::{ClusterDriver as _, KindCluster};
use crate::drivers::workload::HelmWorkload;
use crate::health::{CheckStatus, HealthProbe, default_checks};
use crate::reconcile::report::ReportSink;

/// Run the health checks against an already-running environment
///
/// Checks run concurrently but report in declaration order; a failing check
/// never stops the others. The exit code is the overall report status.
#[derive(Args, Debug)]
#[command()]
pub struct Cli {
    /// The profile to resolve
    #[arg(long)]
    profile: Option<String>,

    /// Include the feature-level checks on top of the basic liveness pair
    #[arg(long)]
    full: bool,
}

impl Cli {
    pub fn exec(self, machine: bool) -> Result<ExitCode> {
        let spec = super::resolve_spec(self.profile.as_deref(), false)?;
        let cluster = KindCluster::new();
        let workload = HelmWorkload::new();
        let mut sink = ReportSink::open(machine);

        cluster.select_context(&spec.cluster.name)?;

        let probe = HealthProbe::new(&workload, &spec);
        let report = probe.run(&default_checks(&spec, self.full), &CancelToken::new());
        for check in &report.checks {
            sink.record_check(check);
        }

        let passed = report
            .checks
            .iter()
            .filter(|check| check.status == CheckStatus::Pass)
            .count();
        if report.passed() {
            success!("{passed}/{} checks passed", report.checks.len());
            Ok(ExitCode::SUCCESS)
        } else {
            error!("{passed}/{} checks passed", report.checks.len());
            Ok(ExitCode::FAILURE)
        }
    }
}
