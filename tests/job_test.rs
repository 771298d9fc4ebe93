//! Integration tests for the job data model (spec.md §3/§8): requestsSent
//! arithmetic and namespace layout, exercised as plain data without a
//! cluster.

use std::collections::HashMap;

use kube_loadgen::job::{ChurnConfig, Job, JobType, ObjectSpec};

fn object(replicas: u32, run_once: bool) -> ObjectSpec {
    ObjectSpec {
        template: "unused.yaml".to_string(),
        replicas,
        input_vars: HashMap::new(),
        run_once,
        wait_options: None,
        namespace: None,
    }
}

fn job(iterations: u32, namespaced: bool, objects: Vec<ObjectSpec>) -> Job {
    Job {
        name: "test-job".to_string(),
        job_type: JobType::Create,
        iterations,
        qps: 10,
        burst: 10,
        namespaced_iterations: namespaced,
        namespace: "loadgen".to_string(),
        pod_wait: false,
        wait_when_finished: false,
        verify_objects: false,
        error_on_verify: false,
        job_iteration_delay_secs: 0,
        max_wait_timeout_secs: 60,
        pre_load_images: false,
        pre_load_period_secs: 0,
        churn: ChurnConfig::default(),
        cleanup: true,
        namespace_labels: HashMap::new(),
        objects,
    }
}

#[test]
fn expected_requests_matches_spec_scenario_one() {
    // spec.md §8 scenario 1: 2 iterations x {deployment, pod, service, secret(runOnce)}.
    let j = job(2, true, vec![object(1, false), object(1, false), object(1, false), object(1, true)]);
    assert_eq!(j.expected_requests(), 7);
}

#[test]
fn expected_requests_counts_run_once_objects_a_single_time() {
    let j = job(5, false, vec![object(3, true)]);
    assert_eq!(j.expected_requests(), 3);
}

#[test]
fn expected_requests_sums_replicas_across_non_run_once_objects() {
    let j = job(3, false, vec![object(2, false), object(4, false)]);
    assert_eq!(j.expected_requests(), 18);
}

#[test]
fn namespaced_iterations_produce_one_namespace_per_iteration() {
    let j = job(4, true, vec![object(1, false)]);
    assert_eq!(j.namespaces(), vec!["loadgen-1", "loadgen-2", "loadgen-3", "loadgen-4"]);
}

#[test]
fn non_namespaced_iterations_share_a_single_namespace() {
    let j = job(4, false, vec![object(1, false)]);
    assert_eq!(j.namespaces(), vec!["loadgen"]);
}

#[test]
fn namespace_for_iteration_matches_namespaces_list() {
    let j = job(3, true, vec![object(1, false)]);
    for i in 1..=3 {
        assert_eq!(j.namespace_for_iteration(i), j.namespaces()[(i - 1) as usize]);
    }
}
