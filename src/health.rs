//! Post-deploy health checks.
//!
//! Checks are declared in order, run concurrently (they are read-only and
//! independent), and merged back in declaration order so the report is
//! deterministic regardless of completion timing. A failing check never
//! stops the others; the report surfaces every failure in one run.

use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

use crate::app::CancelToken;
use crate::drivers::workload::{StatusError, WorkloadDriver};
use crate::spec::EnvironmentSpec;
use crate::util::first_line;

#[derive(Clone, Debug)]
pub struct CheckSpec {
    pub name: String,
    pub kind: CheckKind,
    pub timeout: Duration,
    pub required: bool,
    /// Regex the statement output must match for the check to pass.
    pub expect: Option<String>,
}

#[derive(Clone, Debug)]
pub enum CheckKind {
    /// Release deployed and every workload pod ready.
    PodsReady,
    /// One statement through the query shell.
    Query { statement: String },
}

/// The built-in check sequence for an environment. `full` adds the
/// feature-level check on top of the basic liveness pair.
pub fn default_checks(spec: &EnvironmentSpec, full: bool) -> Vec<CheckSpec> {
    let timeout = spec.check_timeout();
    let mut checks = vec![
        CheckSpec {
            name: "pods-ready".into(),
            kind: CheckKind::PodsReady,
            timeout,
            required: true,
            expect: None,
        },
        CheckSpec {
            name: "query-responds".into(),
            kind: CheckKind::Query {
                statement: spec.query.probe_statement.clone(),
            },
            timeout,
            required: true,
            expect: spec.query.probe_expect.clone(),
        },
    ];
    if full {
        checks.push(CheckSpec {
            name: "feature-available".into(),
            kind: CheckKind::Query {
                statement: spec.query.feature_statement.clone(),
            },
            timeout,
            required: true,
            expect: spec.query.feature_expect.clone(),
        });
    }
    checks
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckStatus {
    Pass,
    /// Tool reachable, wrong result.
    Fail,
    /// Tool or pod unreachable.
    Error,
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub required: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Ordered aggregate of check results; immutable once produced.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn passed(&self) -> bool {
        self.checks
            .iter()
            .all(|check| !check.required || check.status == CheckStatus::Pass)
    }
}

pub struct HealthProbe<'a, W> {
    driver: &'a W,
    spec: &'a EnvironmentSpec,
}

impl<'a, W: WorkloadDriver + Sync> HealthProbe<'a, W> {
    pub fn new(driver: &'a W, spec: &'a EnvironmentSpec) -> Self {
        Self { driver, spec }
    }

    /// Run every check, one worker each, and merge the results back in
    /// declaration order.
    pub fn run(&self, checks: &[CheckSpec], cancel: &CancelToken) -> HealthReport {
        let mut indexed: Vec<(usize, CheckResult)> = thread::scope(|scope| {
            let handles: Vec<_> = checks
                .iter()
                .enumerate()
                .map(|(index, check)| {
                    scope.spawn(move || (index, self.run_check(check, cancel)))
                })
                .collect();
            handles
                .into_iter()
                .zip(checks.iter().enumerate())
                .map(|(handle, (index, check))| {
                    handle.join().unwrap_or_else(|_| {
                        (
                            index,
                            CheckResult {
                                name: check.name.clone(),
                                status: CheckStatus::Error,
                                required: check.required,
                                latency_ms: 0,
                                diagnostic: Some("check worker panicked".into()),
                            },
                        )
                    })
                })
                .collect()
        });
        indexed.sort_by_key(|(index, _)| *index);
        HealthReport {
            checks: indexed.into_iter().map(|(_, result)| result).collect(),
        }
    }

    fn run_check(&self, check: &CheckSpec, cancel: &CancelToken) -> CheckResult {
        let started = Instant::now();
        let (status, diagnostic) = if cancel.is_cancelled() {
            (CheckStatus::Cancelled, None)
        } else {
            match &check.kind {
                CheckKind::PodsReady => self.check_pods(),
                CheckKind::Query { statement } => self.check_query(check, statement, cancel),
            }
        };
        CheckResult {
            name: check.name.clone(),
            status,
            required: check.required,
            latency_ms: started.elapsed().as_millis() as u64,
            diagnostic,
        }
    }

    fn check_pods(&self) -> (CheckStatus, Option<String>) {
        match self.driver.status(self.spec) {
            Err(StatusError::Cancelled) => (CheckStatus::Cancelled, None),
            Err(error) => (CheckStatus::Error, Some(error.to_string())),
            Ok(status) if status.ready() => (CheckStatus::Pass, None),
            Ok(status) => (CheckStatus::Fail, Some(status.to_string())),
        }
    }

    fn check_query(
        &self,
        check: &CheckSpec,
        statement: &str,
        cancel: &CancelToken,
    ) -> (CheckStatus, Option<String>) {
        match self.driver.exec(self.spec, statement, check.timeout, cancel) {
            Err(StatusError::Cancelled) => (CheckStatus::Cancelled, None),
            Err(error) => (CheckStatus::Error, Some(error.to_string())),
            Ok(result) if !result.success => (
                CheckStatus::Fail,
                Some(first_line(&result.stderr).to_string()),
            ),
            Ok(result) => match &check.expect {
                None => (CheckStatus::Pass, None),
                Some(pattern) => match Regex::new(pattern) {
                    Err(error) => (
                        CheckStatus::Error,
                        Some(format!("invalid expectation {pattern:?}: {error}")),
                    ),
                    Ok(expect) if expect.is_match(&result.stdout) => (CheckStatus::Pass, None),
                    Ok(_) => (
                        CheckStatus::Fail,
                        Some(format!(
                            "output {:?} did not match {pattern:?}",
                            first_line(&result.stdout)
                        )),
                    ),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::drivers::testutil::FakeWorkload;
    use crate::spec::Resolver;

    fn spec() -> EnvironmentSpec {
        Resolver::new(None, BTreeMap::new()).resolve().unwrap()
    }

    fn query_check(name: &str, statement: &str, expect: Option<&str>) -> CheckSpec {
        CheckSpec {
            name: name.into(),
            kind: CheckKind::Query {
                statement: statement.into(),
            },
            timeout: Duration::from_secs(5),
            required: true,
            expect: expect.map(Into::into),
        }
    }

    #[test]
    fn all_default_checks_pass_against_a_ready_workload() {
        let spec = spec();
        let driver = FakeWorkload::installed_and_ready();
        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&default_checks(&spec, true), &CancelToken::new());
        assert_eq!(report.checks.len(), 3);
        assert!(report.passed());
        assert!(
            report
                .checks
                .iter()
                .all(|check| check.status == CheckStatus::Pass)
        );
    }

    #[test]
    fn report_keeps_declaration_order_under_concurrency() {
        let spec = spec();
        let driver = FakeWorkload::installed_and_ready();
        driver.script_exec("slow", Duration::from_millis(150), true, "1\n");
        driver.script_exec("fast", Duration::ZERO, true, "1\n");
        let checks = vec![
            query_check("slow-first", "slow", None),
            query_check("fast-second", "fast", None),
        ];

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&checks, &CancelToken::new());
        let names: Vec<_> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["slow-first", "fast-second"]);
    }

    #[test]
    fn later_checks_still_run_after_an_early_failure() {
        let spec = spec();
        let driver = FakeWorkload::installed_and_ready();
        driver.script_exec("broken", Duration::ZERO, false, "");
        let checks = vec![
            query_check("first-fails", "broken", None),
            query_check("second-runs", "ok", None),
        ];

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&checks, &CancelToken::new());
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
        assert_eq!(report.checks[1].status, CheckStatus::Pass);
        assert!(!report.passed());
    }

    #[test]
    fn unreachable_tool_is_an_error_not_a_failure() {
        let spec = spec();
        let driver = FakeWorkload {
            exec_unreachable: true,
            ..FakeWorkload::installed_and_ready()
        };
        let checks = vec![query_check("probe", "RETURN 1;", None)];

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&checks, &CancelToken::new());
        assert_eq!(report.checks[0].status, CheckStatus::Error);
    }

    #[test]
    fn expectation_mismatch_is_a_failure() {
        let spec = spec();
        let driver = FakeWorkload::installed_and_ready();
        driver.script_exec("count", Duration::ZERO, true, "zero\n");
        let checks = vec![query_check("count-check", "count", Some(r"\d+"))];

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&checks, &CancelToken::new());
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
        assert!(report.checks[0].diagnostic.as_deref().unwrap().contains("did not match"));
    }

    #[test]
    fn pods_ready_fails_when_nothing_is_installed() {
        let spec = spec();
        let driver = FakeWorkload::default();
        let checks = vec![CheckSpec {
            name: "pods-ready".into(),
            kind: CheckKind::PodsReady,
            timeout: Duration::from_secs(5),
            required: true,
            expect: None,
        }];

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&checks, &CancelToken::new());
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
    }

    #[test]
    fn cancelled_token_marks_checks_cancelled() {
        let spec = spec();
        let driver = FakeWorkload::installed_and_ready();
        let cancel = CancelToken::new();
        cancel.cancel();

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&default_checks(&spec, false), &cancel);
        assert!(
            report
                .checks
                .iter()
                .all(|check| check.status == CheckStatus::Cancelled)
        );
        assert!(!report.passed());
    }

    #[test]
    fn optional_checks_do_not_gate_the_report() {
        let spec = spec();
        let driver = FakeWorkload::installed_and_ready();
        driver.script_exec("flaky", Duration::ZERO, false, "");
        let mut check = query_check("nice-to-have", "flaky", None);
        check.required = false;

        let probe = HealthProbe::new(&driver, &spec);
        let report = probe.run(&[check], &CancelToken::new());
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
        assert!(report.passed());
    }
}
