//! Chart-based workload lifecycle via the installer and orchestration CLIs.

use std::io::Write as _;
use std::process::Command;
use std::time::Duration;
use std::{fmt, io, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tempfile::NamedTempFile;

use crate::app::{self, CancelToken, Monitored};
use crate::spec::{EnvironmentSpec, WorkloadSpec};

/// Point-in-time snapshot of the deployed workload. Always taken from live
/// tool output, never cached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub release_deployed: bool,
    pub pods: Vec<PodStatus>,
    pub services: Vec<String>,
    pub claims: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

impl WorkloadStatus {
    pub fn ready(&self) -> bool {
        self.release_deployed && !self.pods.is_empty() && self.pods.iter().all(|pod| pod.ready)
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = self.pods.iter().filter(|pod| pod.ready).count();
        write!(
            f,
            "release {}, {ready}/{} pods ready, {} services, {} claims",
            if self.release_deployed {
                "deployed"
            } else {
                "absent"
            },
            self.pods.len(),
            self.services.len(),
            self.claims.len(),
        )
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum InstallError {
    #[snafu(display("could not run {program:?}: {source}"))]
    Unreachable { program: String, source: io::Error },

    #[snafu(display("could not create namespace {namespace:?}:\n{output}"))]
    Namespace { namespace: String, output: String },

    #[snafu(display("could not render chart values: {source}"))]
    RenderValues { source: serde_yaml::Error },

    #[snafu(display("could not stage chart values: {source}"))]
    StageValues { source: io::Error },

    #[snafu(display("chart install failed:\n{output}"))]
    Failed { output: String },

    #[snafu(display(
        "workload was not ready within {}s (last observed: {})",
        limit.as_secs(),
        last_status.as_deref().map(ToString::to_string).unwrap_or_else(|| "unknown".into()),
    ))]
    ReadinessTimeout {
        limit: Duration,
        output: String,
        last_status: Option<Box<WorkloadStatus>>,
    },

    #[snafu(display("install was cancelled"))]
    Cancelled,
}

impl InstallError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum StatusError {
    #[snafu(display("could not run {program:?}: {source}"))]
    Unreachable { program: String, source: io::Error },

    #[snafu(display("status query failed:\n{output}"))]
    Query { output: String },

    #[snafu(display("could not parse status output: {source}"))]
    Parse { source: serde_json::Error },

    #[snafu(display("no workload pod found in namespace {namespace:?}"))]
    NoPods { namespace: String },

    #[snafu(display("cancelled"))]
    Cancelled,
}

/// Captured result of one query-shell statement.
#[derive(Clone, Debug)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A failed teardown sub-step. Recorded, never fatal.
#[derive(Clone, Debug)]
pub struct UninstallStepError {
    pub step: &'static str,
    pub detail: String,
    pub unreachable: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TeardownReport {
    pub errors: Vec<UninstallStepError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub trait WorkloadDriver {
    /// Upsert install: creates the namespace if absent, installs or
    /// upgrades the release, and blocks until ready or timeout.
    fn install(&self, spec: &EnvironmentSpec, cancel: &CancelToken) -> Result<(), InstallError>;

    /// Best-effort removal of the release, its storage claims, and the
    /// namespace, in that order. Sub-step failures are collected, never
    /// raised.
    fn uninstall(&self, spec: &EnvironmentSpec) -> TeardownReport;

    fn status(&self, spec: &EnvironmentSpec) -> Result<WorkloadStatus, StatusError>;

    fn logs(&self, spec: &EnvironmentSpec, lines: u32) -> Result<String, StatusError>;

    /// Run one query-shell statement inside the first workload pod.
    fn exec(
        &self,
        spec: &EnvironmentSpec,
        statement: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecResult, StatusError>;
}

/// Label selector matching every resource the chart stamps for a release.
pub fn instance_selector(release: &str) -> String {
    format!("app.kubernetes.io/instance={release}")
}

pub struct HelmWorkload {
    helm_program: String,
    kubectl_program: String,
}

impl HelmWorkload {
    pub fn new() -> Self {
        let config = app::config();
        Self::with_programs(&config.helm_program, &config.kubectl_program)
    }

    pub fn with_programs(helm_program: &str, kubectl_program: &str) -> Self {
        Self {
            helm_program: helm_program.into(),
            kubectl_program: kubectl_program.into(),
        }
    }

    fn ensure_namespace(&self, namespace: &str) -> Result<(), InstallError> {
        let unreachable = |source| InstallError::Unreachable {
            program: self.kubectl_program.clone(),
            source,
        };
        let found = Command::new(&self.kubectl_program)
            .args(["get", "namespace", namespace, "-o", "name"])
            .output()
            .map_err(unreachable)?;
        if found.status.success() {
            return Ok(());
        }

        let created = Command::new(&self.kubectl_program)
            .args(["create", "namespace", namespace])
            .output()
            .map_err(unreachable)?;
        if created.status.success() {
            Ok(())
        } else {
            Err(InstallError::Namespace {
                namespace: namespace.into(),
                output: String::from_utf8_lossy(&created.stderr).into_owned(),
            })
        }
    }

    fn kubectl_lines(
        &self,
        namespace: &str,
        release: &str,
        resource: &str,
    ) -> Result<Vec<String>, StatusError> {
        let output = Command::new(&self.kubectl_program)
            .args(["get", resource, "-n", namespace])
            .args(["-l", &instance_selector(release)])
            .args(["-o", "name"])
            .output()
            .map_err(|source| StatusError::Unreachable {
                program: self.kubectl_program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(StatusError::Query {
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(parse_resource_names(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

impl WorkloadDriver for HelmWorkload {
    fn install(&self, spec: &EnvironmentSpec, cancel: &CancelToken) -> Result<(), InstallError> {
        let workload = &spec.workload;
        self.ensure_namespace(&workload.namespace)?;

        let rendered =
            render_values(workload).map_err(|source| InstallError::RenderValues { source })?;
        let values_file =
            stage_file(&rendered).map_err(|source| InstallError::StageValues { source })?;

        let limit = spec.ready_timeout();
        let mut command = Command::new(&self.helm_program);
        command.args(["upgrade", "--install", &workload.release]);
        command.arg(&workload.chart.reference);
        if let Some(repo) = &workload.chart.repo {
            command.args(["--repo", repo]);
        }
        command.args(["--version", &workload.chart.version.to_string()]);
        command.args(["--namespace", &workload.namespace]);
        command.arg("--values").arg(display_path(values_file.path()));
        command.args(["--wait", "--timeout", &format!("{}s", limit.as_secs())]);

        let monitored = app::run_monitored(
            &mut command,
            format!("Installing workload {}", workload.release),
            Some(limit + Duration::from_secs(60)),
            cancel,
        )
        .map_err(|source| InstallError::Unreachable {
            program: self.helm_program.clone(),
            source,
        })?;

        match monitored {
            Monitored::Finished(captured) if captured.success => Ok(()),
            Monitored::Finished(captured) => {
                let output = captured.detail();
                if output.contains("timed out") {
                    Err(InstallError::ReadinessTimeout {
                        limit,
                        output,
                        last_status: self.status(spec).ok().map(Box::new),
                    })
                } else {
                    Err(InstallError::Failed { output })
                }
            }
            Monitored::TimedOut(captured) => Err(InstallError::ReadinessTimeout {
                limit,
                output: captured.detail(),
                last_status: self.status(spec).ok().map(Box::new),
            }),
            Monitored::Cancelled(_) => Err(InstallError::Cancelled),
        }
    }

    fn uninstall(&self, spec: &EnvironmentSpec) -> TeardownReport {
        let workload = &spec.workload;
        let mut report = TeardownReport::default();
        let mut record = |step: &'static str, result: io::Result<std::process::Output>| {
            match result {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let detail = String::from_utf8_lossy(&output.stderr).into_owned();
                    // An already-gone release is a satisfied teardown, not
                    // a failure.
                    if !detail.contains("not found") {
                        report.errors.push(UninstallStepError {
                            step,
                            detail,
                            unreachable: false,
                        });
                    }
                }
                Err(source) => report.errors.push(UninstallStepError {
                    step,
                    detail: source.to_string(),
                    unreachable: true,
                }),
            }
        };

        waiting!("Uninstalling release {}", workload.release);
        record(
            "uninstall-release",
            Command::new(&self.helm_program)
                .args(["uninstall", &workload.release])
                .args(["--namespace", &workload.namespace])
                .arg("--wait")
                .output(),
        );

        waiting!("Deleting storage claims for {}", workload.release);
        record(
            "delete-claims",
            Command::new(&self.kubectl_program)
                .args(["delete", "pvc", "-n", &workload.namespace])
                .args(["-l", &instance_selector(&workload.release)])
                .arg("--ignore-not-found")
                .output(),
        );

        waiting!("Deleting namespace {}", workload.namespace);
        record(
            "delete-namespace",
            Command::new(&self.kubectl_program)
                .args(["delete", "namespace", &workload.namespace])
                .arg("--ignore-not-found")
                .output(),
        );

        report
    }

    fn status(&self, spec: &EnvironmentSpec) -> Result<WorkloadStatus, StatusError> {
        let workload = &spec.workload;

        let release = Command::new(&self.helm_program)
            .args(["status", &workload.release])
            .args(["--namespace", &workload.namespace])
            .args(["-o", "json"])
            .output()
            .map_err(|source| StatusError::Unreachable {
                program: self.helm_program.clone(),
                source,
            })?;
        let release_deployed = if release.status.success() {
            parse_release_deployed(&String::from_utf8_lossy(&release.stdout))
                .map_err(|source| StatusError::Parse { source })?
        } else {
            let stderr = String::from_utf8_lossy(&release.stderr);
            if stderr.contains("not found") {
                false
            } else {
                return Err(StatusError::Query {
                    output: stderr.into_owned(),
                });
            }
        };

        let pods = Command::new(&self.kubectl_program)
            .args(["get", "pods", "-n", &workload.namespace])
            .args(["-l", &instance_selector(&workload.release)])
            .args(["-o", "json"])
            .output()
            .map_err(|source| StatusError::Unreachable {
                program: self.kubectl_program.clone(),
                source,
            })?;
        if !pods.status.success() {
            return Err(StatusError::Query {
                output: String::from_utf8_lossy(&pods.stderr).into_owned(),
            });
        }
        let pods = parse_pod_list(&String::from_utf8_lossy(&pods.stdout))
            .map_err(|source| StatusError::Parse { source })?;

        Ok(WorkloadStatus {
            release_deployed,
            pods,
            services: self.kubectl_lines(&workload.namespace, &workload.release, "service")?,
            claims: self.kubectl_lines(&workload.namespace, &workload.release, "pvc")?,
        })
    }

    fn logs(&self, spec: &EnvironmentSpec, lines: u32) -> Result<String, StatusError> {
        let workload = &spec.workload;
        let output = Command::new(&self.kubectl_program)
            .args(["logs", "-n", &workload.namespace])
            .args(["-l", &instance_selector(&workload.release)])
            .args(["--tail", &lines.to_string()])
            .output()
            .map_err(|source| StatusError::Unreachable {
                program: self.kubectl_program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(StatusError::Query {
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn exec(
        &self,
        spec: &EnvironmentSpec,
        statement: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecResult, StatusError> {
        let workload = &spec.workload;
        let status = self.status(spec)?;
        let pod = status
            .pods
            .first()
            .map(|pod| pod.name.clone())
            .ok_or_else(|| StatusError::NoPods {
                namespace: workload.namespace.clone(),
            })?;

        let mut command = Command::new(&self.kubectl_program);
        command.args(["exec", &pod, "-n", &workload.namespace, "--"]);
        command.args(&spec.query.shell);
        command.args(["-u", &workload.credentials.username]);
        command.args(["-p", &workload.credentials.password]);
        command.arg(statement);

        let monitored = app::run_quiet(&mut command, Some(timeout), cancel).map_err(|source| {
            StatusError::Unreachable {
                program: self.kubectl_program.clone(),
                source,
            }
        })?;

        Ok(match monitored {
            Monitored::Finished(captured) => ExecResult {
                success: captured.success,
                stdout: captured.stdout,
                stderr: captured.stderr,
            },
            Monitored::TimedOut(captured) => ExecResult {
                success: false,
                stdout: captured.stdout,
                stderr: format!(
                    "statement did not finish within {}s\n{}",
                    timeout.as_secs(),
                    captured.stderr
                ),
            },
            Monitored::Cancelled(_) => return Err(StatusError::Cancelled),
        })
    }
}

#[derive(Serialize)]
struct ChartValues<'a> {
    neo4j: CoreValues<'a>,
    volumes: VolumeValues<'a>,
    #[serde(flatten)]
    extra: &'a IndexMap<String, serde_yaml::Value>,
}

#[derive(Serialize)]
struct CoreValues<'a> {
    name: &'a str,
    password: &'a str,
    resources: ResourceValues<'a>,
}

#[derive(Serialize)]
struct ResourceValues<'a> {
    cpu: &'a str,
    memory: &'a str,
}

#[derive(Serialize)]
struct VolumeValues<'a> {
    data: VolumeMode<'a>,
}

#[derive(Serialize)]
struct VolumeMode<'a> {
    mode: &'a str,
}

fn render_values(workload: &WorkloadSpec) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&ChartValues {
        neo4j: CoreValues {
            name: &workload.release,
            password: &workload.credentials.password,
            resources: ResourceValues {
                cpu: &workload.resources.cpu,
                memory: &workload.resources.memory,
            },
        },
        volumes: VolumeValues {
            data: VolumeMode {
                mode: "defaultStorageClass",
            },
        },
        extra: &workload.extra_values,
    })
}

#[derive(Deserialize)]
struct ReleaseStatus {
    info: ReleaseInfo,
}

#[derive(Deserialize)]
struct ReleaseInfo {
    status: String,
}

fn parse_release_deployed(json: &str) -> Result<bool, serde_json::Error> {
    let status: ReleaseStatus = serde_json::from_str(json)?;
    Ok(status.info.status == "deployed")
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<PodItem>,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodItemStatus,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodItemStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Deserialize)]
struct ContainerStatus {
    ready: bool,
}

fn parse_pod_list(json: &str) -> Result<Vec<PodStatus>, serde_json::Error> {
    let list: PodList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| PodStatus {
            name: item.metadata.name,
            ready: !item.status.container_statuses.is_empty()
                && item.status.container_statuses.iter().all(|c| c.ready),
            phase: item.status.phase,
        })
        .collect())
}

/// `-o name` prints one `kind/name` per line.
fn parse_resource_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            Some(
                line.rsplit_once('/')
                    .map_or(line, |(_, name)| name)
                    .to_string(),
            )
        })
        .collect()
}

fn stage_file(contents: &str) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn display_path(path: &Path) -> String {
    dunce::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::spec::Resolver;

    fn workload_spec() -> WorkloadSpec {
        Resolver::new(None, BTreeMap::new())
            .resolve()
            .unwrap()
            .workload
    }

    #[test]
    fn rendered_values_carry_credentials_and_resources() {
        let rendered = render_values(&workload_spec()).unwrap();
        assert!(rendered.contains("name: graphdb"));
        assert!(rendered.contains("password: testbed-dev-password"));
        assert!(rendered.contains("cpu: '1'"));
        assert!(rendered.contains("memory: 2Gi"));
        assert!(rendered.contains("mode: defaultStorageClass"));
    }

    #[test]
    fn extra_values_flatten_into_the_document_root() {
        let mut workload = workload_spec();
        workload.extra_values.insert(
            "services".into(),
            serde_yaml::from_str("neo4j: {enabled: true}").unwrap(),
        );
        let rendered = render_values(&workload).unwrap();
        assert!(rendered.contains("services:"));
        assert!(rendered.contains("enabled: true"));
    }

    #[test]
    fn release_status_parses_deployed_flag() {
        assert!(parse_release_deployed(r#"{"info":{"status":"deployed"}}"#).unwrap());
        assert!(!parse_release_deployed(r#"{"info":{"status":"failed"}}"#).unwrap());
        assert!(parse_release_deployed("not json").is_err());
    }

    #[test]
    fn pod_list_readiness_requires_every_container() {
        let json = r#"{
            "items": [
                {
                    "metadata": {"name": "graphdb-0"},
                    "status": {
                        "phase": "Running",
                        "containerStatuses": [{"ready": true}, {"ready": false}]
                    }
                },
                {
                    "metadata": {"name": "graphdb-1"},
                    "status": {
                        "phase": "Running",
                        "containerStatuses": [{"ready": true}]
                    }
                },
                {
                    "metadata": {"name": "graphdb-2"},
                    "status": {"phase": "Pending"}
                }
            ]
        }"#;
        let pods = parse_pod_list(json).unwrap();
        assert_eq!(pods.len(), 3);
        assert!(!pods[0].ready);
        assert!(pods[1].ready);
        // No containers reported yet means not ready.
        assert!(!pods[2].ready);
        assert_eq!(pods[2].phase, "Pending");
    }

    #[test]
    fn resource_names_drop_the_kind_prefix() {
        let names = parse_resource_names("service/graphdb\nservice/graphdb-admin\n\n");
        assert_eq!(names, vec!["graphdb", "graphdb-admin"]);
    }

    #[test]
    fn status_readiness_requires_release_and_pods() {
        let mut status = WorkloadStatus {
            release_deployed: true,
            pods: vec![PodStatus {
                name: "graphdb-0".into(),
                phase: "Running".into(),
                ready: true,
            }],
            ..Default::default()
        };
        assert!(status.ready());

        status.release_deployed = false;
        assert!(!status.ready());

        status.release_deployed = true;
        status.pods.clear();
        assert!(!status.ready());
    }

    #[test]
    fn teardown_report_accumulates_step_errors() {
        let mut report = TeardownReport::default();
        assert!(report.is_clean());
        report.errors.push(UninstallStepError {
            step: "uninstall-release",
            detail: "boom".into(),
            unreachable: false,
        });
        report.errors.push(UninstallStepError {
            step: "delete-namespace",
            detail: "no such file".into(),
            unreachable: true,
        });
        assert!(!report.is_clean());
        assert_eq!(report.errors.len(), 2);
    }
}
