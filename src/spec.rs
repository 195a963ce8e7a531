//! Resolution of the environment specification.
//!
//! Compiled defaults, an optional named profile, and a snapshot of the
//! process environment are merged into one immutable [`EnvironmentSpec`].
//! Resolution is deterministic and has no side effects beyond reading a
//! profile file; environment variables are consumed here and nowhere else.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, io};

use indexmap::IndexMap;
use indoc::indoc;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::platform;

/// Charts older than this lack the readiness endpoints the health checks
/// rely on.
pub const MIN_CHART_VERSION: &str = ">=5.0.0";

const ENV_CLUSTER: &str = "TESTBED_CLUSTER";
const ENV_NAMESPACE: &str = "TESTBED_NAMESPACE";
const ENV_RELEASE: &str = "TESTBED_RELEASE";
const ENV_CHART: &str = "TESTBED_CHART";
const ENV_CHART_REPO: &str = "TESTBED_CHART_REPO";
const ENV_CHART_VERSION: &str = "TESTBED_CHART_VERSION";
const ENV_USERNAME: &str = "TESTBED_USERNAME";
const ENV_PASSWORD: &str = "TESTBED_PASSWORD";
const ENV_EPHEMERAL: &str = "TESTBED_EPHEMERAL";

const BUILTIN_DEFAULT: &str = indoc! {r"
    # Persistent local environment with the compiled-in settings.
"};

const BUILTIN_EPHEMERAL: &str = indoc! {r"
    # Provision, probe, and tear down within a single invocation.
    ephemeral = true
"};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("missing required field {field:?}"))]
    MissingField { field: &'static str },

    #[snafu(display("invalid value {value:?} for {field}: {reason}"))]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[snafu(display("unknown profile {name:?} (not built in, no file at {path:?})"))]
    UnknownProfile { name: String, path: PathBuf },

    #[snafu(display("could not read profile {path:?}: {source}"))]
    ProfileIo { path: PathBuf, source: io::Error },

    #[snafu(display("could not parse profile {name:?}: {source}"))]
    ProfileParse {
        name: String,
        source: toml::de::Error,
    },

    #[snafu(display("chart version {version} is below the supported minimum {minimum:?}"))]
    UnsupportedChartVersion { version: Version, minimum: String },

    #[snafu(display("host port {port} appears in more than one port mapping"))]
    DuplicateHostPort { port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterSpec {
    pub name: String,
    pub node_image: Option<String>,
    pub port_mappings: Vec<PortMapping>,
    pub provision_wait_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceRequests {
    pub cpu: String,
    pub memory: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChartSpec {
    pub repo: Option<String>,
    pub reference: String,
    pub version: Version,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub release: String,
    pub chart: ChartSpec,
    pub credentials: Credentials,
    pub resources: ResourceRequests,
    pub ready_timeout_secs: u64,
    pub extra_values: IndexMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuerySpec {
    /// Base argv of the query shell run inside the workload pod; credentials
    /// and the statement are appended by the driver.
    pub shell: Vec<String>,
    pub probe_statement: String,
    pub probe_expect: Option<String>,
    pub feature_statement: String,
    pub feature_expect: Option<String>,
    pub check_timeout_secs: u64,
}

/// Fully resolved, immutable description of one environment. Every driver
/// call receives this by reference; nothing mutates it after resolution.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnvironmentSpec {
    pub cluster: ClusterSpec,
    pub workload: WorkloadSpec,
    pub query: QuerySpec,
    pub ephemeral: bool,
}

impl EnvironmentSpec {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.workload.ready_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.query.check_timeout_secs)
    }
}

/// A profile is a partial overlay; unset fields fall through to the
/// compiled defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    pub ephemeral: Option<bool>,
    pub cluster: ClusterOverlay,
    pub workload: WorkloadOverlay,
    pub query: QueryOverlay,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterOverlay {
    pub name: Option<String>,
    pub node_image: Option<String>,
    pub port_mappings: Option<Vec<PortMapping>>,
    pub provision_wait_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadOverlay {
    pub namespace: Option<String>,
    pub release: Option<String>,
    pub chart_repo: Option<String>,
    pub chart: Option<String>,
    pub chart_version: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub ready_timeout_secs: Option<u64>,
    pub extra_values: Option<IndexMap<String, serde_yaml::Value>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryOverlay {
    pub shell: Option<Vec<String>>,
    pub probe_statement: Option<String>,
    pub probe_expect: Option<String>,
    pub feature_statement: Option<String>,
    pub feature_expect: Option<String>,
    pub check_timeout_secs: Option<u64>,
}

/// Load a named profile: built-ins first, then
/// `<config dir>/profiles/<name>.toml`.
pub fn load_profile(name: &str) -> Result<Profile, ConfigError> {
    let builtin = match name {
        "default" => Some(BUILTIN_DEFAULT),
        "ephemeral" => Some(BUILTIN_EPHEMERAL),
        _ => None,
    };
    let contents = match builtin {
        Some(contents) => contents.to_string(),
        None => {
            let path = platform::profiles_dir().join(format!("{name}.toml"));
            match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    return Err(ConfigError::UnknownProfile {
                        name: name.into(),
                        path,
                    });
                }
                Err(source) => return Err(ConfigError::ProfileIo { path, source }),
            }
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::ProfileParse {
        name: name.into(),
        source,
    })
}

/// Merges defaults, an optional named profile, and an environment snapshot
/// into an [`EnvironmentSpec`]. Same inputs, same spec.
pub struct Resolver {
    profile_name: Option<String>,
    env: BTreeMap<String, String>,
    ephemeral_flag: bool,
}

impl Resolver {
    pub fn new(profile_name: Option<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            profile_name,
            env,
            ephemeral_flag: false,
        }
    }

    /// Force ephemeral mode on top of whatever the profile says.
    pub fn ephemeral(mut self, flag: bool) -> Self {
        self.ephemeral_flag = flag;
        self
    }

    pub fn resolve(&self) -> Result<EnvironmentSpec, ConfigError> {
        let mut draft = Draft::default();
        if let Some(name) = &self.profile_name {
            draft.apply_profile(&load_profile(name)?);
        }
        draft.apply_env(&self.env)?;
        if self.ephemeral_flag {
            draft.ephemeral = true;
        }
        draft.finish()
    }
}

/// Mutable working copy used during resolution; never escapes this module.
struct Draft {
    cluster_name: String,
    node_image: Option<String>,
    port_mappings: Vec<PortMapping>,
    provision_wait_secs: u64,
    namespace: String,
    release: String,
    chart_repo: Option<String>,
    chart_reference: String,
    chart_version: String,
    username: String,
    password: String,
    cpu: String,
    memory: String,
    ready_timeout_secs: u64,
    extra_values: IndexMap<String, serde_yaml::Value>,
    shell: Vec<String>,
    probe_statement: String,
    probe_expect: Option<String>,
    feature_statement: String,
    feature_expect: Option<String>,
    check_timeout_secs: u64,
    ephemeral: bool,
}

impl Default for Draft {
    fn default() -> Self {
        Self {
            cluster_name: "testbed".into(),
            node_image: None,
            port_mappings: vec![
                PortMapping {
                    host: 7474,
                    container: 7474,
                },
                PortMapping {
                    host: 7687,
                    container: 7687,
                },
            ],
            provision_wait_secs: 180,
            namespace: "graphdb".into(),
            release: "graphdb".into(),
            chart_repo: Some("https://helm.neo4j.com/neo4j".into()),
            chart_reference: "neo4j".into(),
            chart_version: "5.26.0".into(),
            username: "neo4j".into(),
            password: "testbed-dev-password".into(),
            cpu: "1".into(),
            memory: "2Gi".into(),
            ready_timeout_secs: 300,
            extra_values: IndexMap::new(),
            shell: vec!["cypher-shell".into(), "--format".into(), "plain".into()],
            probe_statement: "RETURN 1;".into(),
            probe_expect: Some("1".into()),
            feature_statement: "SHOW FUNCTIONS YIELD name RETURN count(name);".into(),
            feature_expect: Some(r"\d+".into()),
            check_timeout_secs: 60,
            ephemeral: false,
        }
    }
}

macro_rules! overlay {
    ($draft:expr, $source:expr, [$($field:ident => $target:ident),+ $(,)?]) => {
        $(if let Some(value) = $source.$field.clone() {
            $draft.$target = value;
        })+
    };
}

impl Draft {
    fn apply_profile(&mut self, profile: &Profile) {
        if let Some(ephemeral) = profile.ephemeral {
            self.ephemeral = ephemeral;
        }
        overlay!(self, profile.cluster, [
            name => cluster_name,
            port_mappings => port_mappings,
            provision_wait_secs => provision_wait_secs,
        ]);
        if let Some(node_image) = profile.cluster.node_image.clone() {
            self.node_image = Some(node_image);
        }
        overlay!(self, profile.workload, [
            namespace => namespace,
            release => release,
            chart => chart_reference,
            chart_version => chart_version,
            username => username,
            password => password,
            cpu => cpu,
            memory => memory,
            ready_timeout_secs => ready_timeout_secs,
            extra_values => extra_values,
        ]);
        if let Some(repo) = profile.workload.chart_repo.clone() {
            self.chart_repo = Some(repo);
        }
        overlay!(self, profile.query, [
            shell => shell,
            probe_statement => probe_statement,
            feature_statement => feature_statement,
            check_timeout_secs => check_timeout_secs,
        ]);
        if let Some(expect) = profile.query.probe_expect.clone() {
            self.probe_expect = Some(expect);
        }
        if let Some(expect) = profile.query.feature_expect.clone() {
            self.feature_expect = Some(expect);
        }
    }

    fn apply_env(&mut self, env: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        if let Some(value) = env.get(ENV_CLUSTER) {
            self.cluster_name = value.clone();
        }
        if let Some(value) = env.get(ENV_NAMESPACE) {
            self.namespace = value.clone();
        }
        if let Some(value) = env.get(ENV_RELEASE) {
            self.release = value.clone();
        }
        if let Some(value) = env.get(ENV_CHART) {
            self.chart_reference = value.clone();
        }
        if let Some(value) = env.get(ENV_CHART_REPO) {
            self.chart_repo = Some(value.clone());
        }
        if let Some(value) = env.get(ENV_CHART_VERSION) {
            self.chart_version = value.clone();
        }
        if let Some(value) = env.get(ENV_USERNAME) {
            self.username = value.clone();
        }
        if let Some(value) = env.get(ENV_PASSWORD) {
            self.password = value.clone();
        }
        if let Some(value) = env.get(ENV_EPHEMERAL) {
            self.ephemeral = parse_bool(ENV_EPHEMERAL, value)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<EnvironmentSpec, ConfigError> {
        require(&self.cluster_name, "cluster.name")?;
        require(&self.namespace, "workload.namespace")?;
        require(&self.release, "workload.release")?;
        require(&self.chart_reference, "workload.chart")?;
        require(&self.username, "workload.username")?;
        require(&self.password, "workload.password")?;
        if self.shell.is_empty() {
            return Err(ConfigError::MissingField {
                field: "query.shell",
            });
        }

        let version =
            Version::parse(&self.chart_version).map_err(|error| ConfigError::InvalidValue {
                field: "workload.chart_version",
                value: self.chart_version.clone(),
                reason: error.to_string(),
            })?;
        let minimum = VersionReq::parse(MIN_CHART_VERSION).expect("static version requirement");
        if !minimum.matches(&version) {
            return Err(ConfigError::UnsupportedChartVersion {
                version,
                minimum: MIN_CHART_VERSION.into(),
            });
        }

        let mut seen_hosts = BTreeMap::new();
        for mapping in &self.port_mappings {
            if seen_hosts.insert(mapping.host, mapping.container).is_some() {
                return Err(ConfigError::DuplicateHostPort { port: mapping.host });
            }
        }

        Ok(EnvironmentSpec {
            cluster: ClusterSpec {
                name: self.cluster_name,
                node_image: self.node_image,
                port_mappings: self.port_mappings,
                provision_wait_secs: self.provision_wait_secs,
            },
            workload: WorkloadSpec {
                namespace: self.namespace,
                release: self.release,
                chart: ChartSpec {
                    repo: self.chart_repo,
                    reference: self.chart_reference,
                    version,
                },
                credentials: Credentials {
                    username: self.username,
                    password: self.password,
                },
                resources: ResourceRequests {
                    cpu: self.cpu,
                    memory: self.memory,
                },
                ready_timeout_secs: self.ready_timeout_secs,
                extra_values: self.extra_values,
            },
            query: QuerySpec {
                shell: self.shell,
                probe_statement: self.probe_statement,
                probe_expect: self.probe_expect,
                feature_statement: self.feature_statement,
                feature_expect: self.feature_expect,
                check_timeout_secs: self.check_timeout_secs,
            },
            ephemeral: self.ephemeral,
        })
    }
}

fn require(value: &str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingField { field })
    } else {
        Ok(())
    }
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field,
            value: value.into(),
            reason: "expected a boolean".into(),
        }),
    }
}
