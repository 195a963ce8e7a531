//! Local cluster lifecycle via the `kind`-compatible runtime CLI.

use std::io::Write as _;
use std::process::Command;
use std::time::Duration;
use std::{io, path::Path};

use serde::Serialize;
use snafu::Snafu;
use tempfile::NamedTempFile;

use crate::app::{self, CancelToken, Monitored};
use crate::spec::ClusterSpec;

/// Informational outcome of an idempotent provision call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    AlreadyExists,
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ProvisionError {
    #[snafu(display("could not run {program:?}: {source}"))]
    Unreachable { program: String, source: io::Error },

    #[snafu(display("cluster runtime failed:\n{output}"))]
    Failed { output: String },

    #[snafu(display("could not render the cluster config: {source}"))]
    RenderConfig { source: serde_yaml::Error },

    #[snafu(display("could not stage the cluster config: {source}"))]
    StageConfig { source: io::Error },

    #[snafu(display("provisioning did not finish within {}s\n{output}", limit.as_secs()))]
    TimedOut { limit: Duration, output: String },

    #[snafu(display("provisioning was cancelled"))]
    Cancelled,
}

impl ProvisionError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ContextError {
    #[snafu(display("could not run {program:?}: {source}"))]
    Unreachable { program: String, source: io::Error },

    #[snafu(display("no context for cluster {name:?}:\n{output}"))]
    Missing { name: String, output: String },
}

impl ContextError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

pub trait ClusterDriver {
    fn exists(&self, name: &str) -> Result<bool, ProvisionError>;

    /// Create the cluster unless one with this name is already running.
    fn provision(
        &self,
        cluster: &ClusterSpec,
        cancel: &CancelToken,
    ) -> Result<Provisioned, ProvisionError>;

    /// Best-effort removal; the cluster being absent is not an error.
    fn destroy(&self, name: &str) -> Result<(), ProvisionError>;

    /// Point the orchestration CLI at the named cluster. Must succeed
    /// before any workload call.
    fn select_context(&self, name: &str) -> Result<(), ContextError>;
}

/// The context name the runtime registers for a cluster.
pub fn context_name(cluster: &str) -> String {
    format!("kind-{cluster}")
}

pub struct KindCluster {
    kind_program: String,
    kubectl_program: String,
}

impl KindCluster {
    pub fn new() -> Self {
        let config = app::config();
        Self::with_programs(&config.kind_program, &config.kubectl_program)
    }

    pub fn with_programs(kind_program: &str, kubectl_program: &str) -> Self {
        Self {
            kind_program: kind_program.into(),
            kubectl_program: kubectl_program.into(),
        }
    }

    fn unreachable(&self, source: io::Error) -> ProvisionError {
        ProvisionError::Unreachable {
            program: self.kind_program.clone(),
            source,
        }
    }
}

impl ClusterDriver for KindCluster {
    fn exists(&self, name: &str) -> Result<bool, ProvisionError> {
        let output = Command::new(&self.kind_program)
            .args(["get", "clusters"])
            .output()
            .map_err(|source| self.unreachable(source))?;
        if !output.status.success() {
            return Err(ProvisionError::Failed {
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(contains_cluster(
            &String::from_utf8_lossy(&output.stdout),
            name,
        ))
    }

    fn provision(
        &self,
        cluster: &ClusterSpec,
        cancel: &CancelToken,
    ) -> Result<Provisioned, ProvisionError> {
        if self.exists(&cluster.name)? {
            return Ok(Provisioned::AlreadyExists);
        }

        let rendered = render_cluster_config(cluster)
            .map_err(|source| ProvisionError::RenderConfig { source })?;
        let config_file = stage_file(&rendered).map_err(|source| ProvisionError::StageConfig {
            source,
        })?;

        let limit = Duration::from_secs(cluster.provision_wait_secs);
        let mut command = Command::new(&self.kind_program);
        command.args(["create", "cluster", "--name", &cluster.name]);
        command.arg("--config").arg(display_path(config_file.path()));
        command.args(["--wait", &format!("{}s", cluster.provision_wait_secs)]);

        let monitored = app::run_monitored(
            &mut command,
            format!("Provisioning cluster {}", cluster.name),
            // The runtime enforces its own readiness wait; the outer limit
            // only catches a wedged tool.
            Some(limit + Duration::from_secs(60)),
            cancel,
        )
        .map_err(|source| self.unreachable(source))?;

        match monitored {
            Monitored::Finished(captured) if captured.success => Ok(Provisioned::Created),
            Monitored::Finished(captured) => Err(ProvisionError::Failed {
                output: captured.detail(),
            }),
            Monitored::TimedOut(captured) => Err(ProvisionError::TimedOut {
                limit,
                output: captured.detail(),
            }),
            Monitored::Cancelled(_) => Err(ProvisionError::Cancelled),
        }
    }

    fn destroy(&self, name: &str) -> Result<(), ProvisionError> {
        let mut command = Command::new(&self.kind_program);
        command.args(["delete", "cluster", "--name", name]);

        waiting!("Destroying cluster {name}");
        let output = command
            .output()
            .map_err(|source| self.unreachable(source))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Failed {
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    fn select_context(&self, name: &str) -> Result<(), ContextError> {
        let context = context_name(name);
        let output = Command::new(&self.kubectl_program)
            .args(["config", "use-context", &context])
            .output()
            .map_err(|source| ContextError::Unreachable {
                program: self.kubectl_program.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ContextError::Missing {
                name: name.into(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

/// One cluster per line, as printed by `get clusters`.
fn contains_cluster(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| line.trim() == name)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeConfig<'a> {
    kind: &'static str,
    api_version: &'static str,
    nodes: Vec<RuntimeNode<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeNode<'a> {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_port_mappings: Vec<RuntimePortMapping>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimePortMapping {
    container_port: u16,
    host_port: u16,
}

fn render_cluster_config(cluster: &ClusterSpec) -> Result<String, serde_yaml::Error> {
    let config = RuntimeConfig {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        nodes: vec![RuntimeNode {
            role: "control-plane",
            image: cluster.node_image.as_deref(),
            extra_port_mappings: cluster
                .port_mappings
                .iter()
                .map(|mapping| RuntimePortMapping {
                    container_port: mapping.container,
                    host_port: mapping.host,
                })
                .collect(),
        }],
    };
    serde_yaml::to_string(&config)
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
    use crate::spec::PortMapping;

    fn cluster_spec() -> ClusterSpec {
        ClusterSpec {
            name: "c1".into(),
            node_image: None,
            port_mappings: vec![PortMapping {
                host: 7687,
                container: 7687,
            }],
            provision_wait_secs: 60,
        }
    }

    #[test]
    fn listing_matches_whole_lines_only() {
        let listing = "testbed\nother-cluster\n";
        assert!(contains_cluster(listing, "testbed"));
        assert!(contains_cluster(listing, "other-cluster"));
        assert!(!contains_cluster(listing, "test"));
        assert!(!contains_cluster("", "testbed"));
    }

    #[test]
    fn context_name_uses_runtime_prefix() {
        assert_eq!(context_name("c1"), "kind-c1");
    }

    #[test]
    fn rendered_config_carries_port_mappings() {
        let rendered = render_cluster_config(&cluster_spec()).unwrap();
        assert!(rendered.contains("kind: Cluster"));
        assert!(rendered.contains("apiVersion: kind.x-k8s.io/v1alpha4"));
        assert!(rendered.contains("containerPort: 7687"));
        assert!(rendered.contains("hostPort: 7687"));
        // No image was requested, so none may be pinned.
        assert!(!rendered.contains("image:"));
    }

    #[test]
    fn rendered_config_pins_node_image_when_set() {
        let mut spec = cluster_spec();
        spec.node_image = Some("kindest/node:v1.30.0".into());
        let rendered = render_cluster_config(&spec).unwrap();
        assert!(rendered.contains("image: kindest/node:v1.30.0"));
    }
}
