//! Integration tests for the config file loader (spec.md §6): the
//! `global`/`metricsEndpoints`/`jobs` document shape, loaded end to end
//! from a file on disk.

use kube_loadgen::config::Config;
use kube_loadgen::job::JobType;

fn write_config(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn loads_a_full_job_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
global:
  uuid: null
  gc: true
  measurements:
    - podLatency
    - nodeLatency
metricsEndpoints:
  - indexer: local
    metricName: jobSummary
jobs:
  - name: create-pods
    type: create
    iterations: 2
    qps: 5
    burst: 5
    namespace: loadgen
    namespacedIterations: true
    objects:
      - template: pod.yaml
        replicas: 3
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.global.measurements, vec!["podLatency", "nodeLatency"]);
    assert_eq!(config.metrics_endpoints.len(), 1);
    assert_eq!(config.jobs.len(), 1);

    let job = &config.jobs[0];
    assert_eq!(job.name, "create-pods");
    assert_eq!(job.job_type, JobType::Create);
    assert_eq!(job.iterations, 2);
    assert_eq!(job.objects[0].replicas, 3);
    assert_eq!(job.expected_requests(), 6);
}

#[test]
fn rejects_a_job_with_no_objects() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
global:
  measurements: []
jobs:
  - name: empty-job
    type: create
    namespace: loadgen
    objects: []
"#,
    );

    assert!(Config::load(&path).is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    let result = Config::load(std::path::Path::new("/nonexistent/path/config.yaml"));
    assert!(result.is_err());
}
