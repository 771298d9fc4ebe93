//! Job data model (spec.md §3) plus the runner state machine (C9, §4.11).

pub mod churn;
pub mod runner;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use runner::JobRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    Create,
    Patch,
    Delete,
    Read,
    Kubevirt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DeletionStrategy {
    #[default]
    Default,
    Gvr,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChurnConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cycles: u32,
    #[serde(default)]
    pub percent: u32,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default)]
    pub deletion_strategy: DeletionStrategy,
}

/// Custom readiness predicate (spec.md §9 decision): a dotted field path
/// with an optional trailing `[key=value]` bracket filter on the last
/// segment, and the expected literal value.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOptions {
    pub field_path: String,
    pub expected_value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSpec {
    pub template: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub input_vars: HashMap<String, String>,
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub wait_options: Option<WaitOptions>,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_qps")]
    pub qps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub namespaced_iterations: bool,
    pub namespace: String,
    #[serde(default)]
    pub pod_wait: bool,
    #[serde(default)]
    pub wait_when_finished: bool,
    #[serde(default)]
    pub verify_objects: bool,
    #[serde(default)]
    pub error_on_verify: bool,
    #[serde(default)]
    pub job_iteration_delay_secs: u64,
    #[serde(default = "default_max_wait_timeout")]
    pub max_wait_timeout_secs: u64,
    #[serde(default)]
    pub pre_load_images: bool,
    #[serde(default)]
    pub pre_load_period_secs: u64,
    #[serde(default)]
    pub churn: ChurnConfig,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default)]
    pub namespace_labels: HashMap<String, String>,
    pub objects: Vec<ObjectSpec>,
}

fn default_iterations() -> u32 {
    1
}
fn default_qps() -> u32 {
    10
}
fn default_burst() -> u32 {
    10
}
fn default_max_wait_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Job {
    /// `requestsSent` target: `iterations × Σ replicas(non-runOnce)` plus
    /// `Σ replicas(runOnce)` counted once (spec.md §3 invariant 4).
    pub fn expected_requests(&self) -> u64 {
        let per_iteration: u64 = self.objects.iter().filter(|o| !o.run_once).map(|o| o.replicas as u64).sum();
        let run_once: u64 = self.objects.iter().filter(|o| o.run_once).map(|o| o.replicas as u64).sum();
        per_iteration * self.iterations as u64 + run_once
    }

    pub fn namespace_for_iteration(&self, iteration: u32) -> String {
        if self.namespaced_iterations {
            format!("{}-{}", self.namespace, iteration)
        } else {
            self.namespace.clone()
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        if self.namespaced_iterations {
            (1..=self.iterations).map(|i| self.namespace_for_iteration(i)).collect()
        } else {
            vec![self.namespace.clone()]
        }
    }
}

/// Outcome of a job run (spec.md §4.11).
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_name: String,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub elapsed_secs: f64,
    pub observed_qps: f64,
    pub requests_sent: u64,
    pub passed: bool,
    pub execution_errors: Vec<String>,
    pub indexed_documents: usize,
}
