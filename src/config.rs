//! Configuration file loader (external interface, spec.md §6). Top-level
//! `global` (uuid, gc flag, measurements list), `metricsEndpoints`, and
//! `jobs`. Grounded in the teacher's preference for `serde`-derived
//! structures over hand-rolled parsing; uses `serde_yaml` instead of the
//! teacher's `toml` since object templates and configs in this domain are
//! YAML documents, matching `k8s-openapi`'s own manifest format.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::Job;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub gc: bool,
    #[serde(default)]
    pub measurements: Vec<String>,
    #[serde(default)]
    pub measurements_config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEndpointConfig {
    pub indexer: String,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics_endpoints: Vec<MetricsEndpointConfig>,
    pub jobs: Vec<Job>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::Invalid("config must declare at least one job".to_string()));
        }
        for job in &self.jobs {
            if job.objects.is_empty() {
                return Err(ConfigError::Invalid(format!("job '{}' declares no objects", job.name)));
            }
        }
        Ok(())
    }
}

/// Parse `-p key=value` CLI pairs into the override map merged into the
/// render context ahead of job-level vars (spec.md §6: "Template variables
/// are resolved at load time from a process-environment mapping plus
/// CLI-provided key/value pairs").
pub fn parse_cli_vars(pairs: &[String]) -> Result<HashMap<String, String>, ConfigError> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("'-p {pair}' is not in key=value form")))?;
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_vars_splits_on_first_equals() {
        let vars = parse_cli_vars(&["image=nginx:latest".to_string()]).unwrap();
        assert_eq!(vars.get("image"), Some(&"nginx:latest".to_string()));
    }

    #[test]
    fn parse_cli_vars_rejects_missing_equals() {
        let err = parse_cli_vars(&["noequals".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_rejects_config_with_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "global:\n  measurements: []\njobs: []\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
