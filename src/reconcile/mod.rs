//! The control loop.
//!
//! Given the resolved spec and the current observed state, drives the
//! cluster and workload drivers through an ordered step sequence:
//! `Idle → Provisioning → Installing → Probing → {Ready, Failed}`, with
//! teardown (`TearingDown → Idle`) as an explicit transition that attempts
//! every sub-step unconditionally. Ephemeral runs tear down exactly once
//! after probing concludes, whatever the outcome; cleanup is scheduled by
//! this state machine, never by a signal handler or drop glue.

pub mod report;

use snafu::Snafu;

use crate::app::CancelToken;
use crate::drivers::cluster::{ClusterDriver, ContextError, Provisioned, ProvisionError};
use crate::drivers::workload::{InstallError, UninstallStepError, WorkloadDriver};
use crate::health::{HealthProbe, HealthReport, default_checks};
use crate::spec::EnvironmentSpec;

use report::{ReportSink, StepStatus, StepTimer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Provisioning,
    Installing,
    Probing,
    Ready,
    Failed,
    TearingDown,
}

/// Ordered units of work. Forward steps carry their rollback mapping; the
/// idempotency contract lives in the drivers (provision and namespace
/// creation are create-if-absent, install is an upsert).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileStep {
    ProvisionCluster,
    SelectContext,
    InstallWorkload,
    ProbeWorkload,
    UninstallWorkload,
    DestroyCluster,
}

impl ReconcileStep {
    pub fn name(self) -> &'static str {
        match self {
            Self::ProvisionCluster => "provision-cluster",
            Self::SelectContext => "select-context",
            Self::InstallWorkload => "install-workload",
            Self::ProbeWorkload => "probe-workload",
            Self::UninstallWorkload => "uninstall-workload",
            Self::DestroyCluster => "destroy-cluster",
        }
    }

    pub fn rollback(self) -> Option<ReconcileStep> {
        match self {
            Self::ProvisionCluster => Some(Self::DestroyCluster),
            Self::InstallWorkload => Some(Self::UninstallWorkload),
            _ => None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum RunError {
    #[snafu(display("{source}"), context(false))]
    Provision { source: ProvisionError },

    #[snafu(display("{source}"), context(false))]
    Context { source: ContextError },

    #[snafu(display("{source}"), context(false))]
    Install { source: InstallError },

    #[snafu(display("run was cancelled"))]
    Cancelled,
}

impl RunError {
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Provision { source } => source.is_unreachable(),
            Self::Context { source } => source.is_unreachable(),
            Self::Install { source } => source.is_unreachable(),
            Self::Cancelled => false,
        }
    }
}

/// Where a forward run ended up, plus the probe report that decided it.
#[derive(Debug)]
pub struct RunOutcome {
    pub phase: Phase,
    pub report: HealthReport,
}

/// What teardown managed to do. Errors are accumulated, never raised.
#[derive(Debug, Default)]
pub struct TeardownSummary {
    pub errors: Vec<UninstallStepError>,
    pub destroy_error: Option<ProvisionError>,
}

impl TeardownSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.destroy_error.is_none()
    }

    pub fn tools_unreachable(&self) -> bool {
        self.errors.iter().any(|error| error.unreachable)
            || self
                .destroy_error
                .as_ref()
                .is_some_and(ProvisionError::is_unreachable)
    }
}

pub struct Reconciler<'a, C, W> {
    spec: &'a EnvironmentSpec,
    cluster: &'a C,
    workload: &'a W,
    sink: &'a mut ReportSink,
    phase: Phase,
}

impl<'a, C: ClusterDriver, W: WorkloadDriver + Sync> Reconciler<'a, C, W> {
    pub fn new(
        spec: &'a EnvironmentSpec,
        cluster: &'a C,
        workload: &'a W,
        sink: &'a mut ReportSink,
    ) -> Self {
        Self {
            spec,
            cluster,
            workload,
            sink,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive towards Ready. Ephemeral teardown is the caller's business
    /// (see [`Reconciler::run`]); a probe that fails is an outcome, not an
    /// error.
    pub fn up(&mut self, cancel: &CancelToken) -> Result<RunOutcome, RunError> {
        let result = self.drive_up(cancel);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    /// `up`, then (in ephemeral mode) exactly one teardown, regardless of
    /// how probing or anything before it concluded.
    pub fn run(&mut self, cancel: &CancelToken) -> (Result<RunOutcome, RunError>, Option<TeardownSummary>) {
        let outcome = self.up(cancel);
        let teardown = self.spec.ephemeral.then(|| self.down());
        (outcome, teardown)
    }

    /// Uninstall and reinstall without touching an existing cluster; on an
    /// empty slate this is indistinguishable from `up`.
    pub fn reset(&mut self, cancel: &CancelToken) -> Result<RunOutcome, RunError> {
        let result = self.drive_reset(cancel);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    /// Tear everything down, attempting every sub-step no matter what
    /// failed before or fails along the way. The order is the rollback of
    /// the forward sequence: workload before cluster.
    pub fn down(&mut self) -> TeardownSummary {
        self.phase = Phase::TearingDown;
        let mut summary = TeardownSummary::default();

        let rollbacks = [ReconcileStep::InstallWorkload, ReconcileStep::ProvisionCluster]
            .into_iter()
            .filter_map(ReconcileStep::rollback);
        for step in rollbacks {
            match step {
                ReconcileStep::UninstallWorkload => {
                    summary.errors = self.uninstall_workload();
                }
                ReconcileStep::DestroyCluster => {
                    let timer = StepTimer::start(step.name());
                    match self.cluster.destroy(&self.spec.cluster.name) {
                        Ok(()) => self.sink.record(timer.finish(StepStatus::Succeeded, None)),
                        Err(error) => {
                            self.sink
                                .record(timer.finish(StepStatus::Failed, Some(error.to_string())));
                            summary.destroy_error = Some(error);
                        }
                    }
                }
                _ => {}
            }
        }

        self.phase = Phase::Idle;
        summary
    }

    fn drive_up(&mut self, cancel: &CancelToken) -> Result<RunOutcome, RunError> {
        self.ensure_cluster(cancel)?;
        self.install(cancel)?;
        Ok(self.probe(cancel))
    }

    fn drive_reset(&mut self, cancel: &CancelToken) -> Result<RunOutcome, RunError> {
        self.ensure_cluster(cancel)?;

        // Install-on-empty is fine, so a failed or pointless uninstall is
        // recorded and skipped past, exactly like teardown sub-steps.
        self.uninstall_workload();

        self.install(cancel)?;
        Ok(self.probe(cancel))
    }

    fn uninstall_workload(&mut self) -> Vec<UninstallStepError> {
        let timer = StepTimer::start(ReconcileStep::UninstallWorkload.name());
        let report = self.workload.uninstall(self.spec);
        if report.is_clean() {
            self.sink.record(timer.finish(StepStatus::Succeeded, None));
        } else {
            let detail = report
                .errors
                .iter()
                .map(|error| format!("{}: {}", error.step, error.detail))
                .collect::<Vec<_>>()
                .join("; ");
            self.sink
                .record(timer.finish(StepStatus::Failed, Some(detail)));
        }
        report.errors
    }

    fn ensure_cluster(&mut self, cancel: &CancelToken) -> Result<(), RunError> {
        self.phase = Phase::Provisioning;

        self.guard_cancel(ReconcileStep::ProvisionCluster, cancel)?;
        let timer = StepTimer::start(ReconcileStep::ProvisionCluster.name());
        match self.cluster.provision(&self.spec.cluster, cancel) {
            Ok(Provisioned::Created) => {
                self.sink.record(timer.finish(StepStatus::Succeeded, None));
            }
            Ok(Provisioned::AlreadyExists) => {
                self.sink.record(timer.finish(
                    StepStatus::AlreadySatisfied,
                    Some(format!("cluster {} already exists", self.spec.cluster.name)),
                ));
            }
            Err(error) => {
                let status = match error {
                    ProvisionError::Cancelled => StepStatus::Cancelled,
                    _ => StepStatus::Failed,
                };
                self.sink.record(timer.finish(status, Some(error.to_string())));
                return Err(error.into());
            }
        }

        self.guard_cancel(ReconcileStep::SelectContext, cancel)?;
        let timer = StepTimer::start(ReconcileStep::SelectContext.name());
        match self.cluster.select_context(&self.spec.cluster.name) {
            Ok(()) => {
                self.sink.record(timer.finish(StepStatus::Succeeded, None));
                Ok(())
            }
            Err(error) => {
                self.sink
                    .record(timer.finish(StepStatus::Failed, Some(error.to_string())));
                Err(error.into())
            }
        }
    }

    fn install(&mut self, cancel: &CancelToken) -> Result<(), RunError> {
        self.phase = Phase::Installing;

        self.guard_cancel(ReconcileStep::InstallWorkload, cancel)?;
        let timer = StepTimer::start(ReconcileStep::InstallWorkload.name());
        match self.workload.install(self.spec, cancel) {
            Ok(()) => {
                self.sink.record(timer.finish(StepStatus::Succeeded, None));
                Ok(())
            }
            Err(error) => {
                let status = match error {
                    InstallError::Cancelled => StepStatus::Cancelled,
                    _ => StepStatus::Failed,
                };
                self.sink.record(timer.finish(status, Some(error.to_string())));
                Err(error.into())
            }
        }
    }

    fn probe(&mut self, cancel: &CancelToken) -> RunOutcome {
        self.phase = Phase::Probing;

        let timer = StepTimer::start(ReconcileStep::ProbeWorkload.name());
        let probe = HealthProbe::new(self.workload, self.spec);
        let report = probe.run(&default_checks(self.spec, false), cancel);
        for check in &report.checks {
            self.sink.record_check(check);
        }

        if report.passed() {
            self.sink.record(timer.finish(StepStatus::Succeeded, None));
            self.phase = Phase::Ready;
        } else {
            let failed = report
                .checks
                .iter()
                .filter(|check| check.required && check.status != crate::health::CheckStatus::Pass)
                .map(|check| check.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            self.sink
                .record(timer.finish(StepStatus::Failed, Some(format!("failed checks: {failed}"))));
            self.phase = Phase::Failed;
        }

        RunOutcome {
            phase: self.phase,
            report,
        }
    }

    fn guard_cancel(&mut self, step: ReconcileStep, cancel: &CancelToken) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            let timer = StepTimer::start(step.name());
            self.sink.record(timer.finish(StepStatus::Cancelled, None));
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::drivers::testutil::{FakeCluster, FakeInstall, FakeWorkload};
    use crate::spec::Resolver;

    fn spec(ephemeral: bool) -> EnvironmentSpec {
        let env: BTreeMap<String, String> = ephemeral
            .then(|| [("TESTBED_EPHEMERAL".to_string(), "1".to_string())].into())
            .unwrap_or_default();
        Resolver::new(None, env).resolve().unwrap()
    }

    fn teardown_calls(workload: &FakeWorkload) -> usize {
        workload
            .calls()
            .iter()
            .filter(|call| call.starts_with("teardown:"))
            .count()
    }

    #[test]
    fn up_runs_steps_in_dependency_order() {
        let spec = spec(false);
        let cluster = FakeCluster::default();
        let workload = FakeWorkload::default();
        let mut sink = ReportSink::memory();

        let outcome = Reconciler::new(&spec, &cluster, &workload, &mut sink)
            .up(&CancelToken::new())
            .unwrap();

        assert_eq!(outcome.phase, Phase::Ready);
        assert!(outcome.report.passed());
        assert_eq!(
            cluster.calls(),
            vec!["provision:testbed", "select-context:testbed"]
        );
        assert_eq!(workload.calls()[0], "install:graphdb");

        let steps: Vec<_> = sink.records().iter().map(|r| r.step.clone()).collect();
        assert_eq!(steps[0], "provision-cluster");
        assert_eq!(steps[1], "select-context");
        assert_eq!(steps[2], "install-workload");
        assert_eq!(steps.last().unwrap(), "probe-workload");
    }

    #[test]
    fn second_provision_is_already_satisfied() {
        let spec = spec(false);
        let cluster = FakeCluster::with_cluster("testbed");
        let workload = FakeWorkload::default();
        let mut sink = ReportSink::memory();

        Reconciler::new(&spec, &cluster, &workload, &mut sink)
            .up(&CancelToken::new())
            .unwrap();

        assert_eq!(sink.records()[0].status, StepStatus::AlreadySatisfied);
        assert_eq!(cluster.clusters.lock().unwrap().len(), 1);
    }

    #[test]
    fn ephemeral_run_tears_down_exactly_once_on_probe_failure() {
        let spec = spec(true);
        let cluster = FakeCluster::default();
        let workload = FakeWorkload::default();
        // The probe statement runs but returns the wrong result.
        workload.script_exec("RETURN 1;", Duration::ZERO, false, "");
        let mut sink = ReportSink::memory();

        let mut reconciler = Reconciler::new(&spec, &cluster, &workload, &mut sink);
        let (outcome, teardown) = reconciler.run(&CancelToken::new());

        let outcome = outcome.unwrap();
        assert_eq!(outcome.phase, Phase::Failed);
        assert!(!outcome.report.passed());
        assert!(teardown.is_some());
        assert_eq!(teardown_calls(&workload), 3);
        assert_eq!(
            cluster
                .calls()
                .iter()
                .filter(|call| call.starts_with("destroy:"))
                .count(),
            1
        );
        assert_eq!(reconciler.phase(), Phase::Idle);
    }

    #[test]
    fn ephemeral_run_tears_down_after_readiness_timeout() {
        let spec = spec(true);
        let cluster = FakeCluster::default();
        let workload = FakeWorkload {
            install_behavior: FakeInstall::Timeout,
            ..Default::default()
        };
        let mut sink = ReportSink::memory();

        let (outcome, teardown) =
            Reconciler::new(&spec, &cluster, &workload, &mut sink).run(&CancelToken::new());

        assert!(matches!(
            outcome,
            Err(RunError::Install {
                source: InstallError::ReadinessTimeout { .. }
            })
        ));
        assert!(teardown.is_some_and(|summary| summary.is_clean()));
        assert_eq!(teardown_calls(&workload), 3);
    }

    #[test]
    fn persistent_failure_leaves_everything_in_place() {
        let spec = spec(false);
        let cluster = FakeCluster::default();
        let workload = FakeWorkload {
            install_behavior: FakeInstall::Fail,
            ..Default::default()
        };
        let mut sink = ReportSink::memory();

        let (outcome, teardown) =
            Reconciler::new(&spec, &cluster, &workload, &mut sink).run(&CancelToken::new());

        assert!(outcome.is_err());
        assert!(teardown.is_none());
        assert_eq!(teardown_calls(&workload), 0);
        assert!(cluster.calls().iter().all(|call| !call.starts_with("destroy:")));
    }

    #[test]
    fn teardown_attempts_every_substep_despite_failures() {
        let spec = spec(false);
        let cluster = FakeCluster::with_cluster("testbed");
        let workload = FakeWorkload {
            failing_steps: vec!["uninstall-release"],
            ..FakeWorkload::installed_and_ready()
        };
        let mut sink = ReportSink::memory();

        let summary = Reconciler::new(&spec, &cluster, &workload, &mut sink).down();

        assert_eq!(teardown_calls(&workload), 3);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].step, "uninstall-release");
        assert!(!summary.tools_unreachable());
        // The cluster still went away.
        assert!(cluster.clusters.lock().unwrap().is_empty());
    }

    #[test]
    fn unreachable_tools_surface_through_the_summary() {
        let spec = spec(false);
        let cluster = FakeCluster {
            unreachable: true,
            ..Default::default()
        };
        let workload = FakeWorkload::installed_and_ready();
        let mut sink = ReportSink::memory();

        let summary = Reconciler::new(&spec, &cluster, &workload, &mut sink).down();

        // Workload teardown was still attempted in full.
        assert_eq!(teardown_calls(&workload), 3);
        assert!(summary.destroy_error.is_some());
        assert!(summary.tools_unreachable());
    }

    #[test]
    fn reset_on_empty_state_behaves_like_up() {
        let spec = spec(false);
        let cluster = FakeCluster::default();
        let workload = FakeWorkload::default();
        let mut sink = ReportSink::memory();

        let outcome = Reconciler::new(&spec, &cluster, &workload, &mut sink)
            .reset(&CancelToken::new())
            .unwrap();

        assert_eq!(outcome.phase, Phase::Ready);
        assert!(cluster.calls().contains(&"provision:testbed".to_string()));
        // Uninstall ran first (a no-op), then the install.
        let calls = workload.calls();
        let uninstall = calls.iter().position(|c| c == "teardown:uninstall-release");
        let install = calls.iter().position(|c| c == "install:graphdb");
        assert!(uninstall.unwrap() < install.unwrap());
    }

    #[test]
    fn cancelled_token_stops_before_provisioning() {
        let spec = spec(true);
        let cluster = FakeCluster::default();
        let workload = FakeWorkload::default();
        let mut sink = ReportSink::memory();
        let cancel = CancelToken::new();
        cancel.cancel();

        let (outcome, teardown) =
            Reconciler::new(&spec, &cluster, &workload, &mut sink).run(&cancel);

        assert!(matches!(outcome, Err(RunError::Cancelled)));
        assert!(cluster.calls().iter().all(|c| !c.starts_with("provision:")));
        assert_eq!(sink.records()[0].status, StepStatus::Cancelled);
        // Ephemeral cleanup still ran.
        assert!(teardown.is_some());
        assert_eq!(teardown_calls(&workload), 3);
    }

    #[test]
    fn provision_failure_is_fatal_and_marks_the_run_failed() {
        let spec = spec(false);
        let cluster = FakeCluster {
            fail_provision: true,
            ..Default::default()
        };
        let workload = FakeWorkload::default();
        let mut sink = ReportSink::memory();

        let mut reconciler = Reconciler::new(&spec, &cluster, &workload, &mut sink);
        let outcome = reconciler.up(&CancelToken::new());

        assert!(matches!(outcome, Err(RunError::Provision { .. })));
        assert_eq!(reconciler.phase(), Phase::Failed);
        assert!(workload.calls().is_empty());
    }

    #[test]
    fn rollback_mapping_pairs_forward_and_reverse_steps() {
        assert_eq!(
            ReconcileStep::ProvisionCluster.rollback(),
            Some(ReconcileStep::DestroyCluster)
        );
        assert_eq!(
            ReconcileStep::InstallWorkload.rollback(),
            Some(ReconcileStep::UninstallWorkload)
        );
        assert_eq!(ReconcileStep::ProbeWorkload.rollback(), None);
    }
}
