//! Churn cycle orchestration (spec.md §4.11's Churn transition). Grounded
//! in linkerd's churn controller style (`other_examples`) — namespace
//! lifecycle driven from a typed controller struct — adapted from its
//! continuous oscillation loop to this system's fixed-cycle-count model.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::info;

use super::{ChurnConfig, DeletionStrategy, Job};
use crate::k8s::gateway::{ApiGateway, ObjectRef};

type ResubmitFn<'a> = dyn Fn(u32) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> + Send + Sync + 'a;

/// Run `churn.cycles` churn cycles, each deleting and recreating
/// `churn.percent` of the job's iteration-namespaces.
pub async fn run_churn_cycles<'a>(
    job: &Job,
    churn: &ChurnConfig,
    gateway: &ApiGateway,
    run_id: &str,
    resubmit: &ResubmitFn<'a>,
) -> Vec<String> {
    let mut errors = Vec::new();
    if !churn.enabled || churn.cycles == 0 {
        return errors;
    }

    let namespaces = job.namespaces();
    let sample_size = ((namespaces.len() as u64 * churn.percent as u64) / 100).max(1) as usize;

    for cycle in 0..churn.cycles {
        let cycle_start = tokio::time::Instant::now();
        let mut selected: Vec<(u32, String)> = namespaces
            .iter()
            .enumerate()
            .map(|(idx, ns)| (idx as u32 + 1, ns.clone()))
            .collect();
        selected.shuffle(&mut rand::thread_rng());
        selected.truncate(sample_size.min(selected.len()));

        info!(cycle, count = selected.len(), "churn cycle: deleting selected namespaces");

        for (_, ns) in &selected {
            match churn.deletion_strategy {
                DeletionStrategy::Default => {
                    if let Err(e) = gateway.delete_namespace(ns, true).await {
                        errors.push(format!("churn cycle {cycle}: failed to delete namespace {ns}: {e}"));
                    }
                }
                DeletionStrategy::Gvr => {
                    // The namespace survives; delete each object kind in
                    // place, scoped to this run, before the resubmit step
                    // recreates them.
                    for (api_version, kind) in object_kinds(job) {
                        match gateway.list(&api_version, &kind, &format!("runid={run_id}"), Some(ns)).await {
                            Ok(items) => {
                                for item in items {
                                    let name = item.metadata.name.clone().unwrap_or_default();
                                    let reference = ObjectRef {
                                        kind: kind.clone(),
                                        api_version: api_version.clone(),
                                        namespace: Some(ns.clone()),
                                        name,
                                    };
                                    if let Err(e) = gateway.delete(&reference, None).await {
                                        errors.push(format!(
                                            "churn cycle {cycle}: failed to delete {kind}/{} in {ns}: {e}",
                                            reference.name
                                        ));
                                    }
                                }
                            }
                            Err(e) => errors.push(format!("churn cycle {cycle}: failed to list {kind} in {ns}: {e}")),
                        }
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(churn.delay_secs)).await;

        info!(cycle, "churn cycle: recreating selected namespaces");
        for (iteration, ns) in &selected {
            if churn.deletion_strategy == DeletionStrategy::Default {
                if let Err(e) = gateway.create_namespace(ns, &job.namespace_labels).await {
                    errors.push(format!("churn cycle {cycle}: failed to recreate namespace {ns}: {e}"));
                    continue;
                }
            }
            if let Err(e) = resubmit(*iteration).await {
                errors.push(format!("churn cycle {cycle}: failed to resubmit iteration {iteration}: {e}"));
            }
        }

        let elapsed = cycle_start.elapsed();
        let target = Duration::from_secs(churn.duration_secs);
        if target > elapsed {
            tokio::time::sleep(target - elapsed).await;
        }
    }

    errors
}

/// The distinct `(apiVersion, kind)` pairs a job's object templates
/// declare, read straight off each template file (these fields are never
/// templated themselves), for the `gvr` deletion strategy's per-kind sweep.
fn object_kinds(job: &Job) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut kinds = Vec::new();
    for spec in &job.objects {
        let Ok(raw) = std::fs::read_to_string(&spec.template) else { continue };
        let Ok(value) = serde_yaml::from_str::<serde_json::Value>(&raw) else { continue };
        let api_version = value.get("apiVersion").and_then(|v| v.as_str()).map(str::to_string);
        let kind = value.get("kind").and_then(|v| v.as_str()).map(str::to_string);
        if let (Some(api_version), Some(kind)) = (api_version, kind) {
            if seen.insert((api_version.clone(), kind.clone())) {
                kinds.push((api_version, kind));
            }
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_size_is_at_least_one_when_percent_nonzero() {
        let total = 10u64;
        let percent = 5u64;
        let sample_size = ((total * percent) / 100).max(1);
        assert_eq!(sample_size, 1);
    }

    #[test]
    fn sample_size_scales_with_percent() {
        let total = 10u64;
        let percent = 20u64;
        let sample_size = ((total * percent) / 100).max(1);
        assert_eq!(sample_size, 2);
    }

    #[test]
    fn object_kinds_dedupes_and_reads_templates() {
        let dir = tempfile::tempdir().unwrap();
        let pod_path = dir.path().join("pod.yaml");
        std::fs::write(&pod_path, "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n").unwrap();

        let job = Job {
            name: "j".to_string(),
            job_type: crate::job::JobType::Create,
            iterations: 1,
            qps: 1,
            burst: 1,
            namespaced_iterations: false,
            namespace: "ns".to_string(),
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
            namespace_labels: Default::default(),
            objects: vec![
                crate::job::ObjectSpec {
                    template: pod_path.to_string_lossy().to_string(),
                    replicas: 1,
                    input_vars: Default::default(),
                    run_once: false,
                    wait_options: None,
                    namespace: None,
                },
                crate::job::ObjectSpec {
                    template: pod_path.to_string_lossy().to_string(),
                    replicas: 1,
                    input_vars: Default::default(),
                    run_once: false,
                    wait_options: None,
                    namespace: None,
                },
            ],
        };

        let kinds = object_kinds(&job);
        assert_eq!(kinds, vec![("v1".to_string(), "Pod".to_string())]);
    }
}
