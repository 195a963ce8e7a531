//! In-memory driver fakes recording call sequences, shared by the control
//! loop and probe tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use std::{io, thread};

use crate::app::CancelToken;
use crate::spec::{ClusterSpec, EnvironmentSpec};

use super::cluster::{ClusterDriver, ContextError, Provisioned, ProvisionError};
use super::workload::{
    ExecResult, InstallError, PodStatus, StatusError, TeardownReport, UninstallStepError,
    WorkloadDriver, WorkloadStatus,
};

fn missing_tool() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such binary")
}

#[derive(Default)]
pub struct FakeCluster {
    pub clusters: Mutex<BTreeSet<String>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_provision: bool,
    pub fail_destroy: bool,
    pub unreachable: bool,
}

impl FakeCluster {
    pub fn with_cluster(name: &str) -> Self {
        let fake = Self::default();
        fake.clusters.lock().unwrap().insert(name.into());
        fake
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ClusterDriver for FakeCluster {
    fn exists(&self, name: &str) -> Result<bool, ProvisionError> {
        self.log(format!("exists:{name}"));
        if self.unreachable {
            return Err(ProvisionError::Unreachable {
                program: "kind".into(),
                source: missing_tool(),
            });
        }
        Ok(self.clusters.lock().unwrap().contains(name))
    }

    fn provision(
        &self,
        cluster: &ClusterSpec,
        _cancel: &CancelToken,
    ) -> Result<Provisioned, ProvisionError> {
        self.log(format!("provision:{}", cluster.name));
        if self.unreachable {
            return Err(ProvisionError::Unreachable {
                program: "kind".into(),
                source: missing_tool(),
            });
        }
        if self.fail_provision {
            return Err(ProvisionError::Failed {
                output: "node failed to start".into(),
            });
        }
        if !self.clusters.lock().unwrap().insert(cluster.name.clone()) {
            return Ok(Provisioned::AlreadyExists);
        }
        Ok(Provisioned::Created)
    }

    fn destroy(&self, name: &str) -> Result<(), ProvisionError> {
        self.log(format!("destroy:{name}"));
        if self.unreachable {
            return Err(ProvisionError::Unreachable {
                program: "kind".into(),
                source: missing_tool(),
            });
        }
        if self.fail_destroy {
            return Err(ProvisionError::Failed {
                output: "docker is down".into(),
            });
        }
        self.clusters.lock().unwrap().remove(name);
        Ok(())
    }

    fn select_context(&self, name: &str) -> Result<(), ContextError> {
        self.log(format!("select-context:{name}"));
        if self.unreachable {
            return Err(ContextError::Unreachable {
                program: "kubectl".into(),
                source: missing_tool(),
            });
        }
        if self.clusters.lock().unwrap().contains(name) {
            Ok(())
        } else {
            Err(ContextError::Missing {
                name: name.into(),
                output: "context not found".into(),
            })
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FakeInstall {
    #[default]
    Succeed,
    Timeout,
    Fail,
}

#[derive(Default)]
pub struct FakeWorkload {
    pub calls: Mutex<Vec<String>>,
    pub installed: Mutex<bool>,
    pub install_behavior: FakeInstall,
    pub failing_steps: Vec<&'static str>,
    pub unreachable_steps: Vec<&'static str>,
    pub exec_unreachable: bool,
    /// statement -> (delay, success, stdout)
    pub exec_script: Mutex<BTreeMap<String, (Duration, bool, String)>>,
}

impl FakeWorkload {
    pub fn installed_and_ready() -> Self {
        let fake = Self::default();
        *fake.installed.lock().unwrap() = true;
        fake
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn script_exec(&self, statement: &str, delay: Duration, success: bool, stdout: &str) {
        self.exec_script
            .lock()
            .unwrap()
            .insert(statement.into(), (delay, success, stdout.into()));
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl WorkloadDriver for FakeWorkload {
    fn install(&self, spec: &EnvironmentSpec, _cancel: &CancelToken) -> Result<(), InstallError> {
        self.log(format!("install:{}", spec.workload.release));
        match self.install_behavior {
            FakeInstall::Succeed => {
                *self.installed.lock().unwrap() = true;
                Ok(())
            }
            FakeInstall::Timeout => Err(InstallError::ReadinessTimeout {
                limit: spec.ready_timeout(),
                output: "timed out waiting for the condition".into(),
                last_status: Some(Box::new(WorkloadStatus {
                    release_deployed: true,
                    pods: vec![PodStatus {
                        name: format!("{}-0", spec.workload.release),
                        phase: "Pending".into(),
                        ready: false,
                    }],
                    ..Default::default()
                })),
            }),
            FakeInstall::Fail => Err(InstallError::Failed {
                output: "chart not found".into(),
            }),
        }
    }

    fn uninstall(&self, _spec: &EnvironmentSpec) -> TeardownReport {
        let mut report = TeardownReport::default();
        for step in ["uninstall-release", "delete-claims", "delete-namespace"] {
            self.log(format!("teardown:{step}"));
            if self.unreachable_steps.contains(&step) {
                report.errors.push(UninstallStepError {
                    step,
                    detail: "no such binary".into(),
                    unreachable: true,
                });
            } else if self.failing_steps.contains(&step) {
                report.errors.push(UninstallStepError {
                    step,
                    detail: "refused".into(),
                    unreachable: false,
                });
            }
        }
        *self.installed.lock().unwrap() = false;
        report
    }

    fn status(&self, spec: &EnvironmentSpec) -> Result<WorkloadStatus, StatusError> {
        self.log("status".into());
        if *self.installed.lock().unwrap() {
            Ok(WorkloadStatus {
                release_deployed: true,
                pods: vec![PodStatus {
                    name: format!("{}-0", spec.workload.release),
                    phase: "Running".into(),
                    ready: true,
                }],
                services: vec![spec.workload.release.clone()],
                claims: vec![format!("data-{}-0", spec.workload.release)],
            })
        } else {
            Ok(WorkloadStatus::default())
        }
    }

    fn logs(&self, _spec: &EnvironmentSpec, _lines: u32) -> Result<String, StatusError> {
        self.log("logs".into());
        Ok(String::new())
    }

    fn exec(
        &self,
        _spec: &EnvironmentSpec,
        statement: &str,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<ExecResult, StatusError> {
        self.log(format!("exec:{statement}"));
        if self.exec_unreachable {
            return Err(StatusError::Unreachable {
                program: "kubectl".into(),
                source: missing_tool(),
            });
        }
        let scripted = self.exec_script.lock().unwrap().get(statement).cloned();
        let (delay, success, stdout) =
            scripted.unwrap_or((Duration::ZERO, true, "1\n".to_string()));
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(ExecResult {
            success,
            stdout,
            stderr: if success { String::new() } else { "error".into() },
        })
    }
}
