use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const APP_NAME: &str = "testbed";
const FILE_STEM: &str = "config";

/// Tool-level configuration: which external binaries to invoke and which
/// profile to resolve when none is named on the command line. Environment
/// knobs live in the resolver, not here.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub kind_program: String,
    pub kubectl_program: String,
    pub helm_program: String,
    pub default_profile: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind_program: "kind".into(),
            kubectl_program: "kubectl".into(),
            helm_program: "helm".into(),
            default_profile: None,
        }
    }
}

pub fn path() -> Result<PathBuf> {
    confy::get_configuration_file_path(APP_NAME, FILE_STEM)
        .with_context(|| "unable to find the config file")
}

pub fn load() -> Result<Config> {
    confy::load(APP_NAME, FILE_STEM).with_context(|| "unable to load config")
}

pub fn save(config: Config) -> Result<()> {
    confy::store(APP_NAME, FILE_STEM, config).with_context(|| "unable to save config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_programs_are_bare_names() {
        let config = Config::default();
        assert_eq!(config.kind_program, "kind");
        assert_eq!(config.kubectl_program, "kubectl");
        assert_eq!(config.helm_program, "helm");
        assert!(config.default_profile.is_none());
    }
}
